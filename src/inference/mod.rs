/// 一级批量推理 (Batch Inference Pool)
///
/// ```text
///              ┌─► inference-0 ─┐
/// [frame_rx] ──┼─► inference-1 ─┼──► [result_tx]
///              └─► ...          ┘
/// ```
/// worker 数量由 Resource Sizer 在启动时确定, 运行期间不伸缩。
pub mod pool;
pub mod worker;

pub use pool::BatchInferencePool;
pub use worker::{
    BatchOutcome, InferenceWorker, InferenceWorkerConfig, WorkerHealth, WorkerSettings,
    CONSECUTIVE_ERROR_WARNING,
};
