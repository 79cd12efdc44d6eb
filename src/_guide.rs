/*!

Tutorials, overviews, and etc... for the `covfuzz` crate.

All the documentation that isn't API reference.

# Table of Contents

* [Writing and Instrumenting Targets][writing_targets]
* [How Inputs Are Generated][generation]
* [Cargo Features][cargo_features]
* [Minimum Supported Rust Version][msrv]

 */

pub mod cargo_features;
pub mod generation;
pub mod msrv;
pub mod writing_targets;
