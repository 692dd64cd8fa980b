mod id;
mod multiaddr;

pub use id::*;
pub use multiaddr::*;
