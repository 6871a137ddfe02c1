//! The four pipeline stages, each built from the shared configuration.

use anyhow::{Context, Result};
use chest_core::{default_device, ConfigurationManager, DefaultBackend, TrainingBackend};
use chest_dataset::DataIngestion;
use chest_training::{Evaluation, PrepareBaseModel, Training};
use tracing::info;

pub const DATA_INGESTION: &str = "Data Ingestion";
pub const PREPARE_BASE_MODEL: &str = "Prepare Base Model";
pub const TRAINING: &str = "Training";
pub const EVALUATION: &str = "Evaluation";

/// Announces `name` and runs it. A failure is returned with the stage name
/// added to its context.
pub fn run_stage<T>(name: &str, stage: impl FnOnce() -> Result<T>) -> Result<T> {
    info!(">>>>>> stage {name} started <<<<<<");
    let value = stage().with_context(|| format!("stage {name} failed"))?;
    info!(">>>>>> stage {name} completed <<<<<<");
    Ok(value)
}

pub fn data_ingestion(manager: &ConfigurationManager) -> Result<()> {
    let config = manager.get_data_ingestion_config()?;
    let ingestion = DataIngestion::new(config)?;
    ingestion
        .download_file()
        .with_context(|| format!("downloading {}", ingestion.config().source_url))?;
    ingestion
        .extract_zip_file()
        .with_context(|| format!("extracting {}", ingestion.config().local_data_file.display()))?;
    Ok(())
}

pub fn prepare_base_model(manager: &ConfigurationManager) -> Result<()> {
    let config = manager.get_prepare_base_model_config()?;
    PrepareBaseModel::new(config).run::<DefaultBackend>(&default_device())?;
    Ok(())
}

pub fn training(manager: &ConfigurationManager) -> Result<()> {
    let config = manager.get_training_config()?;
    let history = Training::new(config).train::<TrainingBackend>(&default_device())?;
    if let Some(best) = history.best_epoch() {
        info!(
            "Best epoch {}: val_accuracy {:.4}",
            best.epoch,
            best.val_accuracy.unwrap_or_default()
        );
    }
    Ok(())
}

pub fn evaluation(manager: &ConfigurationManager, publish: bool) -> Result<()> {
    let config = manager.get_evaluation_config()?;
    let registered_model_name = config.registered_model_name.clone();
    let mut evaluation = Evaluation::new(config);
    evaluation.evaluate::<DefaultBackend>(&default_device())?;
    evaluation.persist_score()?;

    if publish {
        let outcome = evaluation
            .publish(&registered_model_name)
            .context("publishing evaluation run")?;
        info!("Tracking run {} ({})", outcome.run_id, outcome.artifact_uri);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_stage_passes_value_through() {
        let value = run_stage("noop", || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_run_stage_keeps_error_chain() {
        let err = run_stage::<()>("failing", || {
            Err(anyhow::anyhow!("disk full")).context("writing scores")
        })
        .unwrap_err();
        assert_eq!(
            format!("{err:#}"),
            "stage failing failed: writing scores: disk full"
        );
    }
}
