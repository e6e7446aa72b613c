//! Converts transform names to actual transform code.
//!
//! # Example
//!
//! To get the zstd transform at level 9:
//! ```
//! # use anyhow::Result;
//! use mrpipe::workload;
//! # fn main() -> Result<()> {
//! let zstd = workload::named("zstd", &["--level".to_string(), "9".to_string()])?;
//! assert_eq!(zstd.name(), "zstd");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::executor::AttemptContext;

pub mod command;
pub mod compress;

/// The external transform applied to every payload.
///
/// Implementations must be safe to call concurrently and repeatedly on the
/// same payload: retries and duplicate keys both re-run the transform, so
/// any scratch state has to be private to the attempt in `ctx`.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    /// Transforms one payload.
    ///
    /// Fails with [`crate::Error::Transform`] when the transform itself
    /// reports an error, [`crate::Error::Io`] on local I/O failure and
    /// [`crate::Error::Timeout`] when `ctx`'s deadline passes.
    fn apply(&self, ctx: &AttemptContext, payload: &[u8]) -> crate::Result<Vec<u8>>;
}

/// A transform backed by a plain function or closure.
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(&[u8]) -> crate::Result<Vec<u8>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _ctx: &AttemptContext, payload: &[u8]) -> crate::Result<Vec<u8>> {
        (self.f)(payload)
    }
}

/// Wraps `f` as a [`Transform`].
pub fn from_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Transform>
where
    F: Fn(&[u8]) -> crate::Result<Vec<u8>> + Send + Sync + 'static,
{
    Arc::new(FnTransform {
        name: name.into(),
        f,
    })
}

/// Names accepted by [`named`].
pub const NAMES: &[&str] = &["identity", "zstd", "lz4", "snappy", "command"];

/// Gets the transform named `name`, configured from `args`.
///
/// Returns [`None`] if no transform with the given name was found, and
/// `Some(Err(_))` if `args` are invalid for it.
pub fn try_named(name: &str, args: &[String]) -> Option<Result<Arc<dyn Transform>>> {
    let transform = match name {
        "identity" => Ok(Arc::new(compress::Identity) as Arc<dyn Transform>),
        "zstd" => compress::zstd_from_args(args).map(|t| Arc::new(t) as Arc<dyn Transform>),
        "lz4" => Ok(Arc::new(compress::Compress::lz4()) as Arc<dyn Transform>),
        "snappy" => Ok(Arc::new(compress::Compress::snappy()) as Arc<dyn Transform>),
        "command" => command::CommandTransform::from_args(args)
            .map(|t| Arc::new(t) as Arc<dyn Transform>),
        _ => return None,
    };
    Some(transform)
}

/// Gets the transform named `name`.
///
/// Returns an [`anyhow::Error`] if no transform with the given name was
/// found or its arguments do not parse.
pub fn named(name: &str, args: &[String]) -> Result<Arc<dyn Transform>> {
    match try_named(name, args) {
        Some(transform) => transform,
        None => bail!(
            "No transform named `{}` found (expected one of: {}).",
            name,
            NAMES.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_name_resolves() {
        for name in NAMES.iter().filter(|n| **n != "command") {
            assert_eq!(named(name, &[]).unwrap().name(), *name);
        }
        let cat = named("command", &["cat".to_string()]).unwrap();
        assert_eq!(cat.name(), "command");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(try_named("md5", &[]).is_none());
        assert!(named("md5", &[]).is_err());
    }

    #[test]
    fn fn_transform_calls_closure() {
        let upper = from_fn("upper", |p: &[u8]| Ok(p.to_ascii_uppercase()));
        let ctx = AttemptContext::new(1, None);
        assert_eq!(upper.apply(&ctx, b"abc").unwrap(), b"ABC");
    }
}
