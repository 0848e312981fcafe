//! Report submission contract.

use async_trait::async_trait;

use crate::converter::Report;
use crate::error::SubmitError;

/// Submits converted reports to the test-data server.
///
/// A failed submission is treated as a conversion error for the item that
/// produced the report.
#[async_trait]
pub trait ReportSubmitter: Send + Sync {
    async fn submit(&self, report: Report) -> Result<(), SubmitError>;
}
