use crate::api::{AnalysisApi, ApiError};
use sbx_core::{
    correlate, derive_processes, AnalysisTask, ForensicReport, InsightRequest,
    ProcessSummary, ProcessTechniqueIndex, TelemetryEvent,
};
use tracing::{debug, warn};

/// Task metadata, its telemetry and the AI report, plus the process to
/// technique index derived from the report.
#[derive(Debug, Clone)]
pub struct CorrelationView {
    task: AnalysisTask,
    events: Vec<TelemetryEvent>,
    report: Option<ForensicReport>,
    index: ProcessTechniqueIndex,
}

impl CorrelationView {
    pub fn new(
        task: AnalysisTask,
        events: Vec<TelemetryEvent>,
        report: Option<ForensicReport>,
    ) -> Self {
        let index = index_for(report.as_ref());
        Self {
            task,
            events,
            report,
            index,
        }
    }

    pub fn task(&self) -> &AnalysisTask {
        &self.task
    }

    /// Telemetry exactly as the backend ordered it.
    pub fn events(&self) -> &[TelemetryEvent] {
        &self.events
    }

    pub fn report(&self) -> Option<&ForensicReport> {
        self.report.as_ref()
    }

    pub fn index(&self) -> &ProcessTechniqueIndex {
        &self.index
    }

    pub fn techniques_for(&self, pid: u32) -> impl Iterator<Item = &str> {
        self.index.techniques_for(pid)
    }

    pub fn processes(&self) -> Vec<ProcessSummary> {
        derive_processes(&self.events)
    }

    /// Installs a new report and rebuilds the index from scratch.
    pub fn replace_report(&mut self, report: ForensicReport) {
        self.index = index_for(Some(&report));
        self.report = Some(report);
    }
}

fn index_for(report: Option<&ForensicReport>) -> ProcessTechniqueIndex {
    correlate(report.and_then(|report| report.mitre_matrix.as_ref()))
}

pub struct CorrelationController<A> {
    api: A,
}

impl<A: AnalysisApi> CorrelationController<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Fetches task, telemetry and report concurrently. The three may finish
    /// in any order; a missing report leaves the view without annotations.
    pub async fn load(&self, task_id: &str) -> Result<CorrelationView, ApiError> {
        let (tasks, events, report) = tokio::join!(
            self.api.list_tasks(),
            self.api.telemetry_history(Some(task_id), None),
            self.api.ai_report(task_id),
        );

        let task = tasks?
            .into_iter()
            .find(|task| task.id == task_id)
            .ok_or_else(|| ApiError::TaskNotFound(task_id.to_string()))?;
        let events = events?;
        let report = match report {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(event = "ai_report_unavailable", task_id, error = %err);
                None
            }
        };

        let view = CorrelationView::new(task, events, report);
        debug!(
            event = "correlation_view_loaded",
            task_id,
            events = view.events.len(),
            annotated_pids = view.index.len()
        );
        Ok(view)
    }

    /// Asks the backend for a fresh report over the view's telemetry and
    /// swaps it in.
    pub async fn request_insight(
        &self,
        view: &mut CorrelationView,
        mode: &str,
    ) -> Result<(), ApiError> {
        let request = InsightRequest {
            processes: view.processes(),
            events: view.events.clone(),
            mode: mode.to_string(),
        };
        let report = self.api.ai_insight(&request).await?;
        view.replace_report(report);
        Ok(())
    }
}
