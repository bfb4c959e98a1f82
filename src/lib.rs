//! `rtas`: a three-party secret-sharing runtime over tensors.
//!
//! Two compute parties (P0, P1) hold additive shares of values; a third,
//! P2, acts as an assistant that supplies correlated randomness (Beaver
//! triples) and may hold its own private inputs. See `SPEC_FULL.md` for the
//! full protocol description.

pub mod barrier;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod party;
pub mod tensor;
pub mod transport;
pub mod triples;
pub mod value;

pub use config::Config;
pub use engine::Engine;
pub use error::{Result, RtasError};
pub use party::{AddressMap, Party};
pub use tensor::{NdTensor, Tensor};
pub use value::{Mode, Value};
