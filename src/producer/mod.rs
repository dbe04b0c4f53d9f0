pub mod engine;
pub mod scheduler;

pub use engine::{EngineContext, Hint, HintMeta, NullEngine, SmcEngine};
pub use scheduler::{AssetEnvelopeEntry, CycleEnvelope, PipelineState, SmcProducer};
