//! Trigger commands routed into controller samples

use async_trait::async_trait;

use super::{CollectReport, CommandReport, Controller};
use crate::domain::SampleId;
use crate::error::Result;
use crate::trigger::TriggerSink;

/// Turns trigger starts and stops into sample commands for one run iteration
pub struct ControllerSink<'a> {
    controller: &'a Controller,
    group: String,
    run: String,
    iteration: u32,
    collect: bool,
    pub reports: Vec<CommandReport>,
    pub collected: Vec<CollectReport>,
}

impl<'a> ControllerSink<'a> {
    pub fn new(controller: &'a Controller, group: &str, run: &str, iteration: u32) -> Self {
        Self {
            controller,
            group: group.to_string(),
            run: run.to_string(),
            iteration,
            collect: true,
            reports: Vec::new(),
            collected: Vec::new(),
        }
    }

    /// Collect each sample right after it stops (default)
    pub fn with_collect(mut self, collect: bool) -> Self {
        self.collect = collect;
        self
    }

    fn sample(&self, sample: u32) -> SampleId {
        SampleId::new(&self.run, self.iteration, sample)
    }

    /// Hosts that failed any command driven through this sink
    pub fn partial(&self) -> bool {
        self.reports.iter().any(|r| r.is_partial()) || self.collected.iter().any(|c| c.command.is_partial())
    }
}

#[async_trait]
impl TriggerSink for ControllerSink<'_> {
    async fn start(&mut self, sample: u32) -> Result<()> {
        let id = self.sample(sample);
        let report = self.controller.start_sample(&self.group, &id).await?;
        self.reports.push(report);
        Ok(())
    }

    async fn stop(&mut self, sample: u32) -> Result<()> {
        let id = self.sample(sample);
        let report = self.controller.stop_sample(&id).await?;
        self.reports.push(report);
        if self.collect {
            let collected = self.controller.collect_sample(&id).await?;
            self.collected.push(collected);
        }
        Ok(())
    }
}
