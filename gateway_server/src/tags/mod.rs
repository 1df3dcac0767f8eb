pub mod alarm;
pub mod expression;
pub mod store;
pub mod structures;

pub use store::{Subscription, TagEntry, TagKind, TagSink, TagStore};
pub use structures::TagValue;
