//! External collaborator interfaces.
//!
//! The update engine talks to the outside world only through these traits:
//! - `transport` - metadata/image fetch, manifest and facts delivery
//! - `installer` - applying images on the primary
//! - `report` - queue for reports that must not be lost
//! - `facts` - hardware and network information

pub mod facts;
pub mod installer;
pub mod report;
pub mod transport;

pub use facts::*;
pub use installer::*;
pub use report::*;
pub use transport::*;
