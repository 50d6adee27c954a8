//! Default slab geometry, generated at build time from `slab.toml`.
//!
//! The library proper is configured through `init` callbacks; these
//! constants exist so demos, benches, and tests share one validated table.
//! Point the `SLAB_CONFIG` environment variable at another TOML file to
//! rebuild with a different geometry.

include!(concat!(env!("OUT_DIR"), "/defaults_gen.rs"));
