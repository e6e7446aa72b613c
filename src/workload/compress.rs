//! In-process transforms: identity and the zstd / lz4 / snappy codecs.
//!

use std::io::Write;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

use super::Transform;
use crate::executor::AttemptContext;
use crate::Error;

/// Passes the payload through unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Identity;

impl Transform for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, _ctx: &AttemptContext, payload: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Zstd { level: i32 },
    Lz4,
    Snappy,
}

#[derive(Parser, Debug, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
struct ZstdArgs {
    #[clap(short, long, value_parser, default_value_t = 3)]
    level: i32,
}

/// Compresses the payload with one of the built-in codecs.
#[derive(Debug, Clone, Copy)]
pub struct Compress {
    algorithm: Algorithm,
}

pub fn zstd_from_args(args: &[String]) -> Result<Compress> {
    let args = ZstdArgs::try_parse_from(args)?;
    Ok(Compress {
        algorithm: Algorithm::Zstd { level: args.level },
    })
}

impl Compress {
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    pub fn lz4() -> Self {
        Self::new(Algorithm::Lz4)
    }

    pub fn snappy() -> Self {
        Self::new(Algorithm::Snappy)
    }
}

impl Transform for Compress {
    fn name(&self) -> &str {
        match self.algorithm {
            Algorithm::Zstd { .. } => "zstd",
            Algorithm::Lz4 => "lz4",
            Algorithm::Snappy => "snappy",
        }
    }

    fn apply(&self, _ctx: &AttemptContext, payload: &[u8]) -> crate::Result<Vec<u8>> {
        match self.algorithm {
            Algorithm::Zstd { level } => zstd::encode_all(payload, level)
                .map_err(|e| Error::transform(format!("zstd compression failed: {e}"))),
            Algorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
            Algorithm::Snappy => {
                let mut compressed = Vec::new();
                let mut encoder = snap::write::FrameEncoder::new(&mut compressed);
                encoder
                    .write_all(payload)
                    .and_then(|_| encoder.flush())
                    .map_err(|e| Error::transform(format!("snappy compression failed: {e}")))?;
                drop(encoder);
                Ok(compressed)
            }
        }
    }
}
