//! Steps turning a READY run into an engine submission.

use super::draft::metadata_step;
use super::providers::{FastqListRow, MetadataService, StorageService};
use super::{first_sample_id, Step, StepContext, StepOutput};
use crate::core::{detail_types, EventEnvelope};
use crate::errors::{reasons, StepError};
use crate::events::EventBus;
use crate::registry::StepId;
use crate::utils::workflow_run_name;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::sync::Arc;

/// Name of the samplesheet written to the cache directory.
pub const SAMPLESHEET_NAME: &str = "SampleSheet.csv";

fn fastq_list_rows(ctx: &StepContext<'_>) -> Result<Vec<FastqListRow>, StepError> {
    let rows = ctx.require("inputs.fastqListRows")?;
    serde_json::from_value(rows).map_err(|e| {
        StepError::fatal(reasons::BAD_INPUT, format!("fastq list rows are malformed: {e}"))
    })
}

/// Flags ORA-compressed inputs.
#[derive(Debug, Clone, Copy)]
pub struct DetermineCompressionType;

#[async_trait]
impl Step for DetermineCompressionType {
    fn id(&self) -> StepId {
        StepId::DetermineCompressionType
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let rows = fastq_list_rows(ctx)?;
        let first = rows
            .first()
            .ok_or_else(|| StepError::fatal(reasons::BAD_INPUT, "fastq list rows are empty"))?;
        let is_ora = first.read1_file_uri.ends_with(".ora");
        Ok(StepOutput::ok_empty().with_scratch("isOra", json!(is_ora)))
    }
}

metadata_step!(GetInstrumentRunIdFromFastqId);

#[async_trait]
impl Step for GetInstrumentRunIdFromFastqId {
    fn id(&self) -> StepId {
        StepId::GetInstrumentRunIdFromFastqId
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let fastq_ids = ctx.require_strings("scratch.fastqIdList")?;
        let first = fastq_ids
            .first()
            .ok_or_else(|| StepError::fatal(reasons::BAD_INPUT, "fastq id list is empty"))?;
        let instrument_run_id = self.metadata.get_instrument_run_id(first).await?;
        Ok(StepOutput::ok_empty().with_scratch("instrumentRunId", json!(instrument_run_id)))
    }
}

/// Index pair and lane parsed from a read group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroup {
    /// i7 index.
    pub index: String,
    /// i5 index, if dual indexed.
    pub index2: Option<String>,
    /// Lane.
    pub lane: u32,
}

/// Parses `<i7>+<i5>.<lane>.<instrumentRunId>` (the i5 part is optional).
#[must_use]
pub fn parse_rgid(rgid: &str) -> Option<ReadGroup> {
    let mut parts = rgid.splitn(3, '.');
    let indexes = parts.next().filter(|s| !s.is_empty())?;
    let lane = parts.next()?.parse().ok()?;
    let (index, index2) = match indexes.split_once('+') {
        Some((i7, i5)) => (i7.to_string(), Some(i5.to_string())),
        None => (indexes.to_string(), None),
    };
    Some(ReadGroup { index, index2, lane })
}

/// Renders a minimal samplesheet for the fastq list rows.
///
/// # Errors
///
/// Returns a `BAD_INPUT` failure for rows with an unparseable read group id.
pub fn render_samplesheet(rows: &[FastqListRow], instrument_run_id: &str) -> Result<String, StepError> {
    let mut sheet = String::new();
    let _ = writeln!(sheet, "[Header]");
    let _ = writeln!(sheet, "FileFormatVersion,2");
    let _ = writeln!(sheet, "RunName,{instrument_run_id}");
    let _ = writeln!(sheet);
    let _ = writeln!(sheet, "[Data]");
    let _ = writeln!(sheet, "Lane,Sample_ID,index,index2");
    for row in rows {
        let group = parse_rgid(&row.rgid).ok_or_else(|| {
            StepError::fatal(reasons::BAD_INPUT, format!("cannot parse read group id '{}'", row.rgid))
        })?;
        let _ = writeln!(
            sheet,
            "{},{},{},{}",
            row.lane,
            row.rgsm,
            group.index,
            group.index2.unwrap_or_default()
        );
    }
    Ok(sheet)
}

/// Builds the samplesheet from the fastq list rows.
#[derive(Debug, Clone, Copy)]
pub struct GenerateMinimalSamplesheetFromFastqListRows;

#[async_trait]
impl Step for GenerateMinimalSamplesheetFromFastqListRows {
    fn id(&self) -> StepId {
        StepId::GenerateMinimalSamplesheetFromFastqListRows
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let rows = fastq_list_rows(ctx)?;
        let instrument_run_id = ctx.require_str("scratch.instrumentRunId")?;
        let sheet = render_samplesheet(&rows, &instrument_run_id)?;
        Ok(StepOutput::ok_empty().with_scratch("samplesheet", json!(sheet)))
    }
}

/// Writes the samplesheet into the run's cache directory.
pub struct UploadSamplesheetToCacheDirectory {
    storage: Arc<dyn StorageService>,
}

impl UploadSamplesheetToCacheDirectory {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self { storage }
    }
}

impl std::fmt::Debug for UploadSamplesheetToCacheDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UploadSamplesheetToCacheDirectory")
    }
}

#[async_trait]
impl Step for UploadSamplesheetToCacheDirectory {
    fn id(&self) -> StepId {
        StepId::UploadSamplesheetToCacheDirectory
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let cache_uri = ctx.require_str("engineParameters.cacheUri")?;
        let sheet = ctx.require_str("scratch.samplesheet")?;
        let uri = format!("{cache_uri}{SAMPLESHEET_NAME}");
        self.storage.put_text(&uri, &sheet).await?;
        Ok(StepOutput::fragment(json!({"inputs": {"samplesheetUri": uri}})))
    }
}

/// Publishes the engine submission request.
pub struct SubmitIcav2WesRequest {
    bus: Arc<dyn EventBus>,
}

impl SubmitIcav2WesRequest {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

impl std::fmt::Debug for SubmitIcav2WesRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubmitIcav2WesRequest")
    }
}

#[async_trait]
impl Step for SubmitIcav2WesRequest {
    fn id(&self) -> StepId {
        StepId::SubmitIcav2WesRequest
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let run = ctx.run;
        let name = workflow_run_name(&run.workflow_name, &run.workflow_version, run.portal_run_id());

        let mut inputs = run.payload.get("inputs").cloned().unwrap_or_else(|| json!({}));
        if let (Value::Object(map), Some(is_ora)) = (&mut inputs, ctx.resolve("scratch.isOra")) {
            map.insert("isOra".into(), is_ora);
        }

        let detail = json!({
            "name": name,
            "inputs": inputs,
            "engineParameters": {
                "pipelineId": ctx.require_str("engineParameters.pipelineId")?,
                "projectId": ctx.require_str("engineParameters.projectId")?,
                "outputUri": ctx.require_str("engineParameters.outputUri")?,
                "logsUri": ctx.resolve("engineParameters.logsUri"),
                "cacheUri": ctx.resolve("engineParameters.cacheUri"),
            },
            "tags": {
                "portalRunId": run.portal_run_id(),
                "libraryId": ctx.resolve("tags.libraryId"),
                "sampleId": first_sample_id(ctx),
            },
        });
        let envelope = EventEnvelope::new(
            ctx.config.event_source.clone(),
            detail_types::ICAV2_WES_REQUEST,
            detail,
        );
        self.bus
            .publish(&envelope)
            .await
            .map_err(|e| StepError::Transient(e.to_string()))?;

        tracing::info!(analysis_name = %name, "Submitted analysis request");
        Ok(StepOutput::ok_empty().with_tracking_handle(name))
    }
}
