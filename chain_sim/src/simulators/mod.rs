//! The four chain actors.

mod care;
mod flood;
mod inventory;
mod power;
mod relief;

pub use care::CareSim;
pub use flood::FloodSim;
pub use power::PowerSim;
pub use relief::ReliefSim;
