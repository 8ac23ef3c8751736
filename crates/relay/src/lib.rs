pub mod bus;
pub mod hook;
pub mod ingest;
pub mod pc;
pub mod session_table;
pub mod subscriber_count;
pub mod turn;

pub use bus::{Bus, BusMessage};
pub use pc::PendingCandidates;
pub use session_table::{SessionTable, new_local_sample_track, new_local_track};
pub use subscriber_count::SubscriberCount;
