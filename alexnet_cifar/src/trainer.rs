//! The epoch loop: train, validate, repeat, then a single test pass.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::data_loader::BatchSource;
use crate::error::{Error, Result};
use crate::layers::Mode;
use crate::loss::{count_correct, cross_entropy_loss};
use crate::model::Model;
use crate::optimizer::Sgd;
use crate::parameter::Parameter;
use crate::tensor::{no_grad, Precision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    TrainingEpoch,
    ValidationPhase,
    TestPhase,
    Done,
    /// A batch failed; the run cannot be resumed.
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::TrainingEpoch => "training",
            Phase::ValidationPhase => "validation",
            Phase::TestPhase => "test",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Validation,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Split::Validation => "validation",
            Split::Test => "test",
        })
    }
}

/// Outcome of one training epoch. `loss` is the loss of the final batch;
/// `mean_loss` averages over all batches of the epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub epochs: usize,
    pub step: usize,
    pub steps: usize,
    pub loss: Precision,
    pub mean_loss: Precision,
    pub elapsed: Duration,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch [{}/{}], Step [{}/{}], Loss: {:.4}",
            self.epoch, self.epochs, self.step, self.steps, self.loss
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccuracyReport {
    pub split: Split,
    pub correct: usize,
    pub total: usize,
}

impl AccuracyReport {
    /// `100 · correct / total`, or zero for an empty split.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.total as f64
        }
    }
}

impl fmt::Display for AccuracyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Accuracy of the network on the {} {} images: {:.2} %",
            self.total,
            self.split,
            self.percent()
        )
    }
}

/// Any line the loop reports.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Epoch(EpochReport),
    Accuracy(AccuracyReport),
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Epoch(r) => r.fmt(f),
            Report::Accuracy(r) => r.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub train: EpochReport,
    pub validation: AccuracyReport,
}

/// Owns the network and optimizer for a whole run and walks
/// `Idle → (TrainingEpoch → ValidationPhase)* → Done → TestPhase`. Any
/// training or validation error moves it to `Aborted`.
pub struct Trainer<M: Model> {
    model: M,
    optimizer: Sgd,
    parameters: Vec<Parameter>,
    epochs: usize,
    epoch: usize,
    phase: Phase,
    pending: Option<EpochReport>,
    history: Vec<EpochSummary>,
}

impl<M: Model> Trainer<M> {
    pub fn new(model: M, optimizer: Sgd, epochs: usize) -> Result<Self> {
        if epochs == 0 {
            return Err(Error::Config("epochs must be at least 1".into()));
        }
        let parameters = model.parameters();
        Ok(Trainer {
            model,
            optimizer,
            parameters,
            epochs,
            epoch: 0,
            phase: Phase::Idle,
            pending: None,
            history: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn history(&self) -> &[EpochSummary] {
        &self.history
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Runs every remaining epoch and prints each report line to stdout.
    pub fn fit(&mut self, train: &mut impl BatchSource, valid: &mut impl BatchSource) -> Result<Vec<EpochSummary>> {
        self.fit_with(train, valid, |report| println!("{report}"))
    }

    pub fn fit_with(
        &mut self,
        train: &mut impl BatchSource,
        valid: &mut impl BatchSource,
        mut on_report: impl FnMut(&Report),
    ) -> Result<Vec<EpochSummary>> {
        while self.phase != Phase::Done {
            let report = self.train_epoch(train)?;
            on_report(&Report::Epoch(report));
            let accuracy = self.validate(valid)?;
            on_report(&Report::Accuracy(accuracy));
        }
        Ok(self.history.clone())
    }

    /// One pass over the training source: forward, loss, zeroed gradients,
    /// backward and an optimizer step per batch.
    pub fn train_epoch(&mut self, source: &mut impl BatchSource) -> Result<EpochReport> {
        if !matches!(self.phase, Phase::Idle | Phase::TrainingEpoch) {
            return Err(Error::InvalidPhase {
                operation: "train_epoch",
                phase: self.phase,
            });
        }
        self.phase = Phase::TrainingEpoch;
        let epoch = self.epoch + 1;
        let started = Instant::now();

        source.reset_epoch();
        let steps = source.num_batches();
        let mut step = 0;
        let mut last_loss = 0.0;
        let mut total_loss = 0.0;
        while source.has_batches() {
            step += 1;
            let loss = match self.train_step(source) {
                Ok(loss) => loss,
                Err(e) => {
                    self.phase = Phase::Aborted;
                    return Err(e.at_batch(Phase::TrainingEpoch, epoch, step));
                }
            };
            debug!(epoch, step, loss, "batch done");
            last_loss = loss;
            total_loss += loss;
        }
        if step == 0 {
            self.phase = Phase::Aborted;
            return Err(Error::Dataset("training source produced no batches".into()));
        }

        let report = EpochReport {
            epoch,
            epochs: self.epochs,
            step,
            steps,
            loss: last_loss,
            mean_loss: total_loss / step as Precision,
            elapsed: started.elapsed(),
        };
        info!(epoch, loss = report.loss, mean_loss = report.mean_loss, "epoch finished");
        debug!(epoch, elapsed = ?report.elapsed, "epoch timing");
        self.phase = Phase::ValidationPhase;
        self.pending = Some(report.clone());
        Ok(report)
    }

    fn train_step(&mut self, source: &mut impl BatchSource) -> Result<Precision> {
        let batch = source.next_batch()?;
        let output = self.model.forward(&batch.images, Mode::Train)?;
        let loss = cross_entropy_loss(&output, &batch.labels)?;
        let value = loss.item()?;

        self.optimizer.zero_grad(&self.parameters);
        loss.backward();
        if let Some(bad) = self.parameters.iter().find(|p| !p.tensor().grad_is_finite()) {
            return Err(Error::NumericalInstability {
                stage: bad.name().to_string(),
                quantity: "gradient",
            });
        }
        self.optimizer.update_params(&self.parameters);
        if let Some(bad) = self.parameters.iter().find(|p| !p.tensor().data_is_finite()) {
            return Err(Error::NumericalInstability {
                stage: bad.name().to_string(),
                quantity: "parameter",
            });
        }
        Ok(value)
    }

    /// Accuracy over the validation source after a training epoch. Moves on
    /// to the next epoch, or to `Done` after the last one.
    pub fn validate(&mut self, source: &mut impl BatchSource) -> Result<AccuracyReport> {
        if self.phase != Phase::ValidationPhase {
            return Err(Error::InvalidPhase {
                operation: "validate",
                phase: self.phase,
            });
        }
        let report = match self.evaluate(source, Split::Validation) {
            Ok(report) => report,
            Err(e) => {
                self.phase = Phase::Aborted;
                return Err(e);
            }
        };
        info!(epoch = self.epoch + 1, accuracy = report.percent(), "validation finished");

        if let Some(train) = self.pending.take() {
            self.history.push(EpochSummary {
                train,
                validation: report,
            });
        }
        self.epoch += 1;
        self.phase = if self.epoch < self.epochs {
            Phase::TrainingEpoch
        } else {
            Phase::Done
        };
        Ok(report)
    }

    /// Accuracy over the test source. Allowed once, after the last epoch.
    pub fn test(&mut self, source: &mut impl BatchSource) -> Result<AccuracyReport> {
        if self.phase != Phase::Done {
            return Err(Error::InvalidPhase {
                operation: "test",
                phase: self.phase,
            });
        }
        self.phase = Phase::TestPhase;
        let report = self.evaluate(source, Split::Test)?;
        info!(accuracy = report.percent(), "test finished");
        Ok(report)
    }

    /// Counts argmax hits in evaluation mode with the gradient tape off. Does
    /// not change the phase.
    pub fn evaluate(&self, source: &mut impl BatchSource, split: Split) -> Result<AccuracyReport> {
        let (phase, epoch) = match split {
            Split::Validation => (Phase::ValidationPhase, self.epoch + 1),
            Split::Test => (Phase::TestPhase, self.epoch),
        };

        source.reset_epoch();
        let mut correct = 0;
        let mut total = 0;
        let mut batch_index = 0;
        no_grad(|| {
            while source.has_batches() {
                batch_index += 1;
                let hits = (|| {
                    let batch = source.next_batch()?;
                    let logits = self.model.forward(&batch.images, Mode::Eval)?;
                    if !logits.data_is_finite() {
                        return Err(Error::NumericalInstability {
                            stage: "logits".into(),
                            quantity: "output",
                        });
                    }
                    total += batch.len();
                    count_correct(&logits, &batch.labels)
                })()
                .map_err(|e| e.at_batch(phase, epoch, batch_index))?;
                correct += hits;
            }
            Ok::<(), Error>(())
        })?;

        Ok(AccuracyReport { split, correct, total })
    }
}
