// XXX: Keep this documented MSRV in sync with the `rust-version` in
// `Cargo.toml`.

/*!

# Minimum Supported Rust Version

`covfuzz` builds with Rust **1.80.0** and newer.

Raising the MSRV is a breaking change for the purposes of this crate's version
numbers: it only happens in minor releases, and only when a newer standard
library or language feature pays for itself.

 */
