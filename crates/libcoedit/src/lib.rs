pub mod bus;
pub mod error;
pub mod locks;
pub mod schema;
pub mod session;
pub mod store;

pub use bus::ChangeBus;
pub use error::CoeditError;
pub use locks::LockRegistry;
pub use schema::{EntityConfig, EntityEntry, EntityRegistry, FieldKind, FieldSpec};
pub use session::{SessionCoordinator, release_session};
pub use store::{DataStore, MemoryStore, Row};
