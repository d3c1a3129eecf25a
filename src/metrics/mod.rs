pub mod histogram;
pub mod percentiles;
pub mod sink;
pub mod stream;

pub use histogram::SignedHistogram;
pub use percentiles::PercentileSet;
pub use sink::{Drained, MetricSink, MetricSnapshot, SinkView};
