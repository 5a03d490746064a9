use anyhow::{Result, bail};
use phimask_config::MaskingMode;
use phimask_engine::sample_and_validate;
use phimask_masking::RuleSet;
use std::path::PathBuf;

use super::{load_config, open_stores};

pub async fn handle(config_path: Option<PathBuf>, collection: String, sample: usize, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if config.masking_mode == MaskingMode::InSitu {
        bail!("Validation needs the untouched source; it is only available in separate mode");
    }
    let rules = RuleSet::load(&config.rules_path)?;
    let stores = open_stores(&config).await?;
    let destination = config.destination_for(&collection);

    let report = sample_and_validate(
        stores.documents.as_ref(),
        &collection,
        stores.documents.as_ref(),
        &destination,
        &rules,
        sample,
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validated {} -> {} ({} documents sampled)", collection, destination, report.sampled);
        println!(
            "  fields expected masked: {}, actually masked: {}",
            report.fields_expected_masked(),
            report.fields_actually_masked()
        );
        for key in &report.missing_documents {
            println!("  missing in destination: {}", key);
        }
        for key in &report.unreadable_documents {
            println!("  unreadable: {}", key);
        }
        for document in report.dirty() {
            for path in &document.report.unexpectedly_unchanged {
                println!("  {} {}: still carries the source value", document.key, path);
            }
            for path in &document.report.unexpectedly_changed {
                println!("  {} {}: changed but should be kept", document.key, path);
            }
            for path in &document.report.missing_in_destination {
                println!("  {} {}: missing in destination", document.key, path);
            }
            for path in &document.report.unexpected_in_destination {
                println!("  {} {}: only in destination", document.key, path);
            }
        }
    }

    if !report.is_clean() {
        bail!("Validation found problems in '{}'", destination);
    }
    println!("✓ No problems found");
    Ok(())
}
