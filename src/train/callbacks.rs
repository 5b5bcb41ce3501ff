//! Hooks into the training loop.
//!
//! The loop keeps a set of named properties in a [`Context`]: `epoch`, `step`, `last_loss`,
//! `train_loss`, the optimizer params and the properties of the current batch. Callbacks run
//! when one of their [`Trigger`]s fires, can read and write properties, and can request a stop.

use std::{
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use derive_more::{Display, From};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{Batch, Model, ModelError};

/// A value of a training property.
#[derive(Debug, Clone, PartialEq, Display, From)]
pub enum Property {
    Int(i64),
    Float(f32),
    Text(String),
}

impl Property {
    /// Numeric value, if any.
    #[inline]
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Property::Int(x) => Some(x as f32),
            Property::Float(x) => Some(x),
            Property::Text(_) => None,
        }
    }
}

impl From<usize> for Property {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<&str> for Property {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// Training state shared with callbacks.
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub properties: HashMap<String, Property>,
    stop: bool,
}

impl Context {
    #[inline]
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Numeric value of a property, if present.
    #[inline]
    pub fn get_f32(&self, name: &str) -> Option<f32> {
        self.get(name).and_then(Property::as_f32)
    }

    #[inline]
    pub fn set(&mut self, name: &str, value: impl Into<Property>) {
        self.properties.insert(name.to_owned(), value.into());
    }

    /// Ends the training loop after the current step.
    #[inline]
    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum At {
    Start,
    End,
}

/// When a callback runs. Steps and epochs count from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    OnLoop(At),
    /// At step `n` only.
    OnStep(usize, At),
    /// At every `n`-th step.
    OnEveryStep(usize, At),
    /// At epoch `n` only.
    OnEpoch(usize, At),
    /// At every `n`-th epoch.
    OnEveryEpoch(usize, At),
}

/// A point of the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Loop(At),
    Step(usize, At),
    Epoch(usize, At),
}

impl Trigger {
    pub fn fires(&self, event: Event) -> bool {
        let every = |n: usize, i: usize| n > 0 && i % n == 0;
        match (*self, event) {
            (Trigger::OnLoop(at), Event::Loop(on)) => at == on,
            (Trigger::OnStep(n, at), Event::Step(i, on)) => at == on && n == i,
            (Trigger::OnEveryStep(n, at), Event::Step(i, on)) => at == on && every(n, i),
            (Trigger::OnEpoch(n, at), Event::Epoch(i, on)) => at == on && n == i,
            (Trigger::OnEveryEpoch(n, at), Event::Epoch(i, on)) => at == on && every(n, i),
            _ => false,
        }
    }
}

pub trait Callback: fmt::Debug {
    fn triggers(&self) -> Vec<Trigger>;

    /// Callbacks firing on the same event run in increasing priority.
    fn priority(&self) -> i32 {
        0
    }

    fn call(&mut self, context: &mut Context, model: &Model) -> Result<(), ModelError>;
}

/// Logs the training progress and the monitored properties.
#[derive(Debug, Clone)]
pub struct Progress {
    pub total_steps: Option<usize>,
    pub monitor: Vec<String>,
    /// Logs every `every` steps.
    pub every: usize,
    start: Option<instant::Instant>,
}

impl Progress {
    pub fn new(total_steps: Option<usize>, monitor: &[&str]) -> Self {
        Self {
            total_steps,
            monitor: monitor.iter().map(|x| x.to_string()).collect(),
            every: 1,
            start: None,
        }
    }
}

impl Callback for Progress {
    fn triggers(&self) -> Vec<Trigger> {
        vec![
            Trigger::OnLoop(At::Start),
            Trigger::OnEveryStep(self.every, At::End),
            Trigger::OnLoop(At::End),
        ]
    }

    fn priority(&self) -> i32 {
        10
    }

    fn call(&mut self, context: &mut Context, _model: &Model) -> Result<(), ModelError> {
        let start = *self.start.get_or_insert_with(instant::Instant::now);
        let step = context.get_f32("step").unwrap_or_default() as usize;
        let elapsed = start.elapsed().as_secs_f32();
        let rate = match elapsed > 0.0 {
            true => step as f32 / elapsed,
            false => 0.0,
        };
        let monitored = self
            .monitor
            .iter()
            .filter_map(|name| context.get(name).map(|value| format!("{name}: {value}")))
            .join(", ");
        match self.total_steps {
            Some(total) => log::info!("step {step}/{total} ({rate:.1} steps/s) {monitored}"),
            None => log::info!("step {step} ({rate:.1} steps/s) {monitored}"),
        }
        Ok(())
    }
}

/// Multiplies a property by `decay_rate` at the end of every epoch after `after` epochs.
#[derive(Debug, Clone)]
pub struct DecayAfter {
    pub after: usize,
    pub decay_rate: f32,
    pub changes: String,
}

impl DecayAfter {
    pub fn new(after: usize, decay_rate: f32, changes: &str) -> Self {
        Self {
            after,
            decay_rate,
            changes: changes.to_owned(),
        }
    }
}

impl Callback for DecayAfter {
    fn triggers(&self) -> Vec<Trigger> {
        vec![Trigger::OnEveryEpoch(1, At::End)]
    }

    fn call(&mut self, context: &mut Context, _model: &Model) -> Result<(), ModelError> {
        let epoch = context.get_f32("epoch").unwrap_or_default() as usize;
        if epoch < self.after {
            return Ok(());
        }
        match context.get_f32(&self.changes) {
            Some(value) => context.set(&self.changes, value * self.decay_rate),
            None => log::warn!("decay after: no numeric property {}", self.changes),
        }
        Ok(())
    }
}

type EvalFn = Box<dyn Fn(f32) -> f32>;

/// Computes the mean eval score over a dataset and stores it as a property.
pub struct Eval {
    pub property: String,
    pub dataset: Vec<Batch>,
    pub trigger: Trigger,
    transform: Option<EvalFn>,
}

impl fmt::Debug for Eval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eval")
            .field("property", &self.property)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl Eval {
    pub fn new(property: &str, dataset: Vec<Batch>, trigger: Trigger) -> Self {
        Self {
            property: property.to_owned(),
            dataset,
            trigger,
            transform: None,
        }
    }

    /// Applies `transform` to the mean score, e.g. `f32::exp` for perplexity.
    pub fn transform(mut self, transform: impl Fn(f32) -> f32 + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }
}

impl Callback for Eval {
    fn triggers(&self) -> Vec<Trigger> {
        vec![self.trigger]
    }

    fn call(&mut self, context: &mut Context, model: &Model) -> Result<(), ModelError> {
        if self.dataset.is_empty() {
            log::warn!("eval: empty dataset for {}", self.property);
            return Ok(());
        }
        let scores = self
            .dataset
            .iter()
            .map(|batch| model.eval_step(&batch.feed))
            .collect::<Result<Vec<_>, _>>()?;
        let mean = scores.iter().sum::<f32>() / scores.len() as f32;
        let value = match &self.transform {
            Some(transform) => transform(mean),
            None => mean,
        };
        context.set(&self.property, value);
        Ok(())
    }
}

/// Tracks whether a monitored value improves by more than a threshold.
#[derive(Debug, Clone)]
struct Improvement {
    threshold: f32,
    lesser_better: bool,
    best: Option<f32>,
}

impl Improvement {
    /// Records `value`, returning `true` if it improves on the best one.
    fn update(&mut self, value: f32) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) if self.lesser_better => best - value > self.threshold,
            Some(best) => value - best > self.threshold,
        };
        if improved {
            self.best = Some(value);
        }
        improved
    }
}

/// Stops training once `target` has not improved for `patience` checks.
#[derive(Debug, Clone)]
pub struct EarlyStop {
    pub patience: usize,
    pub target: String,
    pub trigger: Trigger,
    improvement: Improvement,
    waited: usize,
}

impl EarlyStop {
    pub fn new(patience: usize, target: &str, threshold: f32, lesser_better: bool) -> Self {
        Self {
            patience,
            target: target.to_owned(),
            trigger: Trigger::OnEveryEpoch(1, At::End),
            improvement: Improvement {
                threshold,
                lesser_better,
                best: None,
            },
            waited: 0,
        }
    }
}

impl Callback for EarlyStop {
    fn triggers(&self) -> Vec<Trigger> {
        vec![self.trigger]
    }

    fn priority(&self) -> i32 {
        5
    }

    fn call(&mut self, context: &mut Context, _model: &Model) -> Result<(), ModelError> {
        let Some(value) = context.get_f32(&self.target) else {
            log::warn!("early stop: no numeric property {}", self.target);
            return Ok(());
        };
        match self.improvement.update(value) {
            true => self.waited = 0,
            false => self.waited += 1,
        }
        if self.waited >= self.patience {
            log::info!("early stop: {} did not improve for {} checks", self.target, self.waited);
            context.request_stop();
        }
        Ok(())
    }
}

/// Multiplies `target` by `decay_rate` whenever `monitor` does not improve.
#[derive(Debug, Clone)]
pub struct PlateauDecay {
    pub monitor: String,
    pub target: String,
    pub decay_rate: f32,
    pub trigger: Trigger,
    improvement: Improvement,
}

impl PlateauDecay {
    pub fn new(monitor: &str, target: &str, threshold: f32, decay_rate: f32) -> Self {
        Self {
            monitor: monitor.to_owned(),
            target: target.to_owned(),
            decay_rate,
            trigger: Trigger::OnEveryEpoch(1, At::End),
            improvement: Improvement {
                threshold,
                lesser_better: true,
                best: None,
            },
        }
    }

    #[inline]
    pub fn lesser_better(mut self, lesser_better: bool) -> Self {
        self.improvement.lesser_better = lesser_better;
        self
    }
}

impl Callback for PlateauDecay {
    fn triggers(&self) -> Vec<Trigger> {
        vec![self.trigger]
    }

    fn priority(&self) -> i32 {
        5
    }

    fn call(&mut self, context: &mut Context, _model: &Model) -> Result<(), ModelError> {
        let Some(value) = context.get_f32(&self.monitor) else {
            log::warn!("plateau decay: no numeric property {}", self.monitor);
            return Ok(());
        };
        if self.improvement.update(value) {
            return Ok(());
        }
        if let Some(target) = context.get_f32(&self.target) {
            let decayed = target * self.decay_rate;
            log::debug!("plateau decay: {} {target} -> {decayed}", self.target);
            context.set(&self.target, decayed);
        }
        Ok(())
    }
}

/// Writes the logged properties to a CSV file, one row per trigger.
///
/// The header holds the static columns followed by the logged properties.
/// Missing properties are written as empty cells.
#[derive(Debug)]
pub struct CsvLogger {
    pub path: PathBuf,
    pub logs: Vec<String>,
    pub static_logs: Vec<(String, Property)>,
    pub trigger: Trigger,
    pub priority: i32,
    writer: Option<BufWriter<File>>,
}

impl CsvLogger {
    pub fn new(path: impl Into<PathBuf>, logs: &[&str], trigger: Trigger) -> Self {
        Self {
            path: path.into(),
            logs: logs.iter().map(|x| x.to_string()).collect(),
            static_logs: vec![],
            trigger,
            priority: 20,
            writer: None,
        }
    }

    pub fn static_log(mut self, name: &str, value: impl Into<Property>) -> Self {
        self.static_logs.push((name.to_owned(), value.into()));
        self
    }
}

impl CsvLogger {
    /// Creates the file and writes the header.
    fn open(&self) -> std::io::Result<BufWriter<File>> {
        let mut writer = BufWriter::new(File::create(&self.path)?);
        let header = self
            .static_logs
            .iter()
            .map(|(name, _)| name)
            .chain(&self.logs)
            .join(",");
        writeln!(writer, "{header}")?;
        Ok(writer)
    }
}

impl Callback for CsvLogger {
    fn triggers(&self) -> Vec<Trigger> {
        vec![self.trigger]
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn call(&mut self, context: &mut Context, _model: &Model) -> Result<(), ModelError> {
        if self.writer.is_none() {
            self.writer = Some(self.open()?);
        }
        let row = self
            .static_logs
            .iter()
            .map(|(_, value)| value.to_string())
            .chain(self.logs.iter().map(|name| {
                context
                    .get(name)
                    .map(ToString::to_string)
                    .unwrap_or_default()
            }))
            .join(",");
        if let Some(writer) = &mut self.writer {
            writeln!(writer, "{row}")?;
            writer.flush()?;
        }
        Ok(())
    }
}

type LambdaFn = Box<dyn FnMut(&mut Context, &Model) -> Result<(), ModelError>>;

/// A callback from a closure.
pub struct LambdaCallback {
    pub triggers: Vec<Trigger>,
    pub priority: i32,
    function: LambdaFn,
}

impl fmt::Debug for LambdaCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LambdaCallback")
            .field("triggers", &self.triggers)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl LambdaCallback {
    pub fn new(
        triggers: &[Trigger],
        function: impl FnMut(&mut Context, &Model) -> Result<(), ModelError> + 'static,
    ) -> Self {
        Self {
            triggers: triggers.to_vec(),
            priority: 0,
            function: Box::new(function),
        }
    }
}

impl Callback for LambdaCallback {
    fn triggers(&self) -> Vec<Trigger> {
        self.triggers.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn call(&mut self, context: &mut Context, model: &Model) -> Result<(), ModelError> {
        (self.function)(context, model)
    }
}

#[cfg(test)]
mod tests {
    use super::{At, Event, Property, Trigger};

    #[test]
    fn test_triggers() {
        let every = Trigger::OnEveryStep(2, At::End);
        assert!(every.fires(Event::Step(4, At::End)));
        assert!(!every.fires(Event::Step(3, At::End)));
        assert!(!every.fires(Event::Step(4, At::Start)));
        assert!(!every.fires(Event::Epoch(4, At::End)));

        let once = Trigger::OnEpoch(3, At::Start);
        assert!(once.fires(Event::Epoch(3, At::Start)));
        assert!(!once.fires(Event::Epoch(6, At::Start)));

        assert!(Trigger::OnLoop(At::End).fires(Event::Loop(At::End)));
        assert!(!Trigger::OnEveryEpoch(0, At::End).fires(Event::Epoch(1, At::End)));
    }

    #[test]
    fn test_property() {
        assert_eq!(Property::from(3usize).as_f32(), Some(3.0));
        assert_eq!(Property::from(0.5f32).to_string(), "0.5");
        assert_eq!(Property::from("a").as_f32(), None);
    }
}
