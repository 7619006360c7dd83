//! External verification: the check itself and the gate around it.

mod command;
mod gate;
mod traits;

pub use command::{CommandVerifier, render_output};
pub use gate::VerifierGate;
pub use traits::{Verifier, VerifyRequest};
