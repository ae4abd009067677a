//! Local unit execution: unit files, observed states, the unit manager
//! capability and the state generator that publishes what it observes.

pub mod file;
pub mod generator;
pub mod manager;
pub mod process;
pub mod state;

pub use file::{UnitFile, UnitHash, UnitOption};
pub use generator::UnitStateGenerator;
pub use manager::{FakeUnitManager, ManagedUnit, UnitEvent, UnitManager};
pub use process::ProcessUnitManager;
pub use state::{UnitState, UnitStatus};
