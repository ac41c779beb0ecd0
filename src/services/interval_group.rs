//! Interval group: a window of readings turned into chart-ready series.
//!
//! Readings are normalized to the requested buckets, reduced to the last
//! reading per bucket, expanded with derived series and virtual registers,
//! then aligned onto the bucket timeline. Buckets without a value stay `None`.

use chrono::{DateTime, Utc};
use core::fmt;
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;

use crate::register::code::RegisterCode;
use crate::register::unit::Unit;
use crate::register::value::{NormalizedDurationRegisterValue, RegisterValueError, TimeRegisterValue};
use crate::series::collection::{LabelSeries, LabelSeriesSet, SeriesError};
use crate::series::generators::derive_label_series;
use crate::series::interval::{Bucketing, IntervalSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateError {
    /// A label or register the template reads is not in the window.
    UnsatisfiedDependency { label: String, register: RegisterCode },
    Evaluation(String),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::UnsatisfiedDependency { label, register } => {
                write!(f, "unsatisfied dependency {}:{}", label, register)
            }
            TemplateError::Evaluation(msg) => write!(f, "template evaluation failed: {}", msg),
        }
    }
}

impl Error for TemplateError {}

#[derive(Debug, Clone, PartialEq)]
pub enum IntervalGroupError {
    Value(RegisterValueError),
    Series(SeriesError),
}

impl fmt::Display for IntervalGroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalGroupError::Value(e) => write!(f, "{}", e),
            IntervalGroupError::Series(e) => write!(f, "{}", e),
        }
    }
}

impl Error for IntervalGroupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IntervalGroupError::Value(e) => Some(e),
            IntervalGroupError::Series(e) => Some(e),
        }
    }
}

impl From<RegisterValueError> for IntervalGroupError {
    fn from(value: RegisterValueError) -> Self {
        IntervalGroupError::Value(value)
    }
}

impl From<SeriesError> for IntervalGroupError {
    fn from(value: SeriesError) -> Self {
        IntervalGroupError::Series(value)
    }
}

/// A register synthesized from other series, attached to `label`.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualRegister {
    pub label: String,
    pub register: RegisterCode,
    pub values: Vec<NormalizedDurationRegisterValue>,
}

/// Source of virtual registers. One result per template; failures only drop
/// that template's register.
pub trait TemplateEvaluator {
    fn evaluate(
        &self,
        series: &LabelSeriesSet<NormalizedDurationRegisterValue>,
        bucketing: &Bucketing,
    ) -> Vec<Result<VirtualRegister, TemplateError>>;
}

pub struct NoTemplates;

impl TemplateEvaluator for NoTemplates {
    fn evaluate(
        &self,
        _series: &LabelSeriesSet<NormalizedDurationRegisterValue>,
        _bucketing: &Bucketing,
    ) -> Vec<Result<VirtualRegister, TemplateError>> {
        Vec::new()
    }
}

/// A chart: which (label, register) series it shows, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayGraph {
    pub title: String,
    pub series: Vec<(String, RegisterCode)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignedSeries {
    pub label: String,
    pub register: RegisterCode,
    pub name: Option<String>,
    pub unit: Option<Unit>,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphData {
    pub title: String,
    pub series: Vec<AlignedSeries>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalGroup {
    pub interval: IntervalSpec,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub categories: Vec<DateTime<Utc>>,
    pub graphs: Vec<GraphData>,
}

fn merge_virtual(series: &mut Vec<LabelSeries<NormalizedDurationRegisterValue>>, virtual_register: VirtualRegister) {
    let VirtualRegister { label, register, values } = virtual_register;
    match series.iter_mut().find(|s| s.label() == label) {
        Some(existing) => {
            if let Err(e) = existing.add(register, values) {
                warn!("Interval group: dropping virtual register: {}", e);
            }
        }
        None => {
            let mut builder = LabelSeries::builder(label);
            builder.extend(register, values);
            series.push(builder.build());
        }
    }
}

fn align(
    label: &str,
    register: RegisterCode,
    values: &[NormalizedDurationRegisterValue],
    slots: &BTreeMap<DateTime<Utc>, usize>,
) -> AlignedSeries {
    let mut aligned = vec![None; slots.len()];
    for v in values {
        if let Some(&slot) = slots.get(&v.normalized_end()) {
            aligned[slot] = Some(v.unit_value().value);
        }
    }
    AlignedSeries {
        label: label.to_string(),
        register,
        name: register.name(),
        unit: values.first().map(|v| v.unit_value().unit),
        values: aligned,
    }
}

pub fn build_interval_group<E: TemplateEvaluator>(
    readings: &LabelSeriesSet<TimeRegisterValue>,
    bucketing: Bucketing,
    graphs: &[DisplayGraph],
    evaluator: &E,
) -> Result<IntervalGroup, IntervalGroupError> {
    let start = readings.start();
    let end = readings.end();
    let categories = bucketing.timeline(start, end);
    let normalized_start = bucketing.floor(start);

    let normalized = readings.normalize(|ts| bucketing.floor(ts));
    let mut derived = Vec::with_capacity(normalized.len());
    for series in normalized.iter() {
        derived.push(derive_label_series(&series.last_per_bucket(), start, normalized_start)?);
    }
    let derived = LabelSeriesSet::new(start, end, derived)?;

    let results = evaluator.evaluate(&derived, &bucketing);
    let mut series = derived.into_series();
    for result in results {
        match result {
            Ok(v) => merge_virtual(&mut series, v),
            Err(e @ TemplateError::UnsatisfiedDependency { .. }) => debug!("Interval group: skipping template: {}", e),
            Err(e) => warn!("Interval group: skipping template: {}", e),
        }
    }

    let slots: BTreeMap<DateTime<Utc>, usize> = categories.iter().enumerate().map(|(i, ts)| (*ts, i)).collect();
    let graphs = if graphs.is_empty() {
        let all = series
            .iter()
            .flat_map(|s| s.iter().map(|(code, values)| align(s.label(), *code, values, &slots)))
            .collect();
        vec![GraphData {
            title: "all".to_string(),
            series: all,
        }]
    } else {
        graphs
            .iter()
            .map(|graph| GraphData {
                title: graph.title.clone(),
                series: graph
                    .series
                    .iter()
                    .filter_map(|(label, register)| {
                        let values = series.iter().find(|s| s.label() == label.as_str())?.get(register);
                        if values.is_none() {
                            debug!("Interval group: graph {} has no {}:{}", graph.title, label, register);
                        }
                        values.map(|values| align(label, *register, values, &slots))
                    })
                    .collect(),
            })
            .collect()
    };

    Ok(IntervalGroup {
        interval: bucketing.spec,
        start,
        end,
        categories,
        graphs,
    })
}
