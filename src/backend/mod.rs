//! Model backend capability and loading infrastructure.

pub mod echo;
pub mod loader;
pub mod tiering;
pub mod traits;

pub use echo::{EchoBackend, EchoModel};
pub use loader::Loader;
pub use tiering::{SizeTieredPolicy, Tier, TieringPolicy};
pub use traits::{ModelBackend, ModelHandle};
