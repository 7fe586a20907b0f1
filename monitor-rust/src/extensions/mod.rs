//! In-process observers built on the cluster event stream.

pub mod collision;
pub mod delay_tester;

pub use collision::{spawn_collision_watch, CollisionWarning, CollisionWatch};
pub use delay_tester::{run_delay_test, DelayReport};
