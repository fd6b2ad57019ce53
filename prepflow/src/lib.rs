//! # Prepflow
//!
//! Stage orchestration engine for automated lamella preparation on a
//! charged-particle microscope.
//!
//! Prepflow tracks each sample ("lamella") through a method-specific
//! sequence of imaging/milling/alignment stages with support for:
//!
//! - **Per-method stage graphs**: on-grid, trench, lift-out and serial
//!   lift-out variants share a stage superset but order their own paths
//! - **Durable progress**: the experiment is persisted atomically after
//!   every stage transition, so a multi-day session resumes exactly
//!   where it left off
//! - **Supervision gates**: any stage can require operator confirmation,
//!   or run unattended
//! - **Cooperative abort**: a cancellation token checked between stages,
//!   never mid-stage
//! - **Failure isolation**: one entity's failure never stops its siblings
//!
//! The instrument itself is behind the [`StageExecutor`] contract and a
//! yes/no [`Confirmer`]; the engine is fully testable headlessly.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prepflow::prelude::*;
//! use std::sync::Arc;
//!
//! let mut experiment = Experiment::new("mouse-brain-01", Method::OnGrid)
//!     .with_path("/data/mouse-brain-01/experiment.json");
//! experiment.append(Lamella::new("lamella-01", "/data/mouse-brain-01/lamella-01", Method::OnGrid))?;
//!
//! let runner = WorkflowRunner::new(executor, Arc::new(AutoConfirmer));
//! let report = runner
//!     .run(
//!         &mut experiment,
//!         &[Stage::SetupLamella, Stage::MillRough, Stage::MillPolishing],
//!         &SupervisionMap::unsupervised(),
//!     )
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod contracts;
pub mod errors;
pub mod events;
pub mod experiment;
pub mod graph;
pub mod method;
pub mod runner;
pub mod stage;
pub mod state;
pub mod testing;

pub use contracts::{Confirmer, StageExecutor};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::contracts::{AutoConfirmer, Confirmer, StageExecutor};
    pub use crate::errors::{
        CorruptExperimentError, DuplicateNameError, ExecutionError, InvalidRevertError,
        PrepflowError, RestoreError, StageNotInMethodError, StageSequenceError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::experiment::Experiment;
    pub use crate::graph::StageGraph;
    pub use crate::method::Method;
    pub use crate::runner::{RunReport, SupervisionMap, WorkflowRunner};
    pub use crate::stage::{Stage, StageRecord};
    pub use crate::state::{Lamella, LamellaState};
}
