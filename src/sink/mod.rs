pub mod jsonl;

use anyhow::Result;

use crate::session::{AttributedPower, Sample};

/// Sink consumes a session's ordered record stream.
///
/// Records must be written incrementally so a consumer can tail partial
/// results; `flush` runs before the session is marked stopped so the
/// file holds the complete ordered sequence.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Append one aligned counter sample.
    fn record_sample(&mut self, sample: &Sample) -> Result<()>;

    /// Append one attributed-power estimate.
    fn record_power(&mut self, power: &AttributedPower) -> Result<()>;

    /// Force buffered records out.
    fn flush(&mut self) -> Result<()>;
}
