// Story data model, script input, and graph validation

pub mod graph;
pub mod model;
pub mod raw;

pub use graph::{GraphError, StoryGraph};
pub use model::{NodeId, PackMeta, StoryNode, Transition, Trigger};
pub use raw::RawStory;
