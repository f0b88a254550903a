//! OCI image materialization contract.
//!
//! `spec.md` §1 scopes image-registry clients out of the core: the runtime
//! only consumes a "materialize OCI image to directory" capability. This
//! module defines that capability as a trait (`ImageSource`) plus one
//! concrete, registry-free implementation (`OciLayoutImageSource`) that
//! flattens an already-pulled OCI image layout directory — the shape an
//! external image puller leaves on disk — into a single tar stream under
//! `/app`. Reference: `spec.md` §4.K step 3.

mod layout;

pub use layout::{ImageMeta, ImageSource, OciLayoutImageSource, OciLayoutError};
