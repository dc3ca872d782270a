//! Subcommand bodies. Each one runs a single controller operation and
//! renders its results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;

use strata_config::{log_cli_info, Config};
use strata_engine::{Controller, PathFilter, RemoteFileKind, RestoreRequest};

use crate::output::{format_bytes, Output};

pub fn backup(controller: &Controller, out: &Output, sources: &[PathBuf]) -> Result<()> {
    let pb = out.track(controller, "backing up");
    let result = controller.backup(sources);
    pb.finish_and_clear();
    controller.clear_unit_observer();
    let results = result.context("backup failed")?;
    log_cli_info!("backup done", version = results.version);

    if out.is_json() {
        out.json(&results)?;
    } else {
        println!();
        println!(
            "  Version {} ({})",
            style(results.version).bold(),
            results.status
        );
        println!(
            "    Files:     {} examined, {} added, {} modified, {} unchanged, {} failed",
            results.examined_files,
            results.added_files,
            results.modified_files,
            results.unchanged_files,
            results.failed_files
        );
        println!(
            "    Blocks:    {} new, {} deduplicated",
            results.new_blocks, results.deduplicated_blocks
        );
        println!(
            "    Uploaded:  {} volume(s), {}",
            results.uploaded_volumes,
            format_bytes(results.uploaded_bytes)
        );
        if !results.deleted_versions.is_empty() {
            println!("    Retention: removed versions {:?}", results.deleted_versions);
        }
    }
    out.finish("backup", &results.report)
}

pub fn restore(
    controller: &Controller,
    out: &Output,
    paths: Vec<String>,
    version: Option<u64>,
    to: Option<PathBuf>,
    overwrite: bool,
) -> Result<()> {
    let mut request = RestoreRequest::new().overwrite(overwrite);
    if let Some(version) = version {
        request = request.version(version);
    }
    if !paths.is_empty() {
        request = request.paths(PathFilter::including(paths));
    }
    if let Some(dir) = to {
        request = request.target(dir);
    }

    let pb = out.track(controller, "restoring");
    let result = controller.restore(&request);
    pb.finish_and_clear();
    controller.clear_unit_observer();
    let results = result.context("restore failed")?;

    if out.is_json() {
        out.json(&results)?;
    } else {
        println!();
        println!(
            "  Restored {} file(s), {} from version {}",
            results.restored_files,
            format_bytes(results.restored_bytes),
            results.version
        );
        if results.skipped_files > 0 {
            println!(
                "    {} existing file(s) left alone, use --overwrite to replace them",
                results.skipped_files
            );
        }
    }
    out.finish("restore", &results.report)
}

pub fn list_versions(controller: &Controller, out: &Output) -> Result<()> {
    let versions = controller.list()?;
    if out.is_json() {
        return out.json(&versions);
    }
    if versions.is_empty() {
        println!("  No backups yet.");
        return Ok(());
    }
    println!("  {:>7}  {:<20}  {:<8}  {:>7}  {:>12}", "VERSION", "CREATED", "STATUS", "FILES", "SIZE");
    for v in versions {
        println!(
            "  {:>7}  {:<20}  {:<8}  {:>7}  {:>12}",
            v.version,
            v.created.format("%Y-%m-%d %H:%M:%S"),
            v.status.to_string(),
            v.file_count,
            format_bytes(v.total_size)
        );
    }
    Ok(())
}

pub fn list_files(
    controller: &Controller,
    out: &Output,
    version: Option<u64>,
    paths: Vec<String>,
) -> Result<()> {
    let filter = if paths.is_empty() {
        PathFilter::all()
    } else {
        PathFilter::including(paths)
    };
    let files = controller.list_files(version, &filter)?;
    if out.is_json() {
        return out.json(&files);
    }
    for file in &files {
        println!("  {:>12}  {}", format_bytes(file.size), file.path);
    }
    println!("  {} file(s)", files.len());
    Ok(())
}

pub fn list_remote(controller: &Controller, out: &Output) -> Result<()> {
    let files = controller.list_remote()?;
    if out.is_json() {
        return out.json(&files);
    }
    for file in &files {
        let kind = match &file.kind {
            RemoteFileKind::Volume { .. } => "volume".to_string(),
            RemoteFileKind::FileList { version, .. } => format!("files v{version}"),
            RemoteFileKind::Unknown => style("unknown").yellow().to_string(),
        };
        println!("  {:>12}  {:<10}  {}", format_bytes(file.size), kind, file.name);
    }
    Ok(())
}

pub fn purge(controller: &Controller, out: &Output, paths: Vec<String>, versions: Vec<u64>) -> Result<()> {
    let filter = PathFilter::including(paths);
    let selected = (!versions.is_empty()).then_some(versions.as_slice());
    let results = controller.purge_files(&filter, selected).context("purge failed")?;

    if out.is_json() {
        out.json(&results)?;
    } else {
        println!(
            "  Purged {} file entr{} from {} version(s), freed {}, deleted {} volume(s)",
            results.removed_file_count,
            if results.removed_file_count == 1 { "y" } else { "ies" },
            results.rewritten_file_lists,
            format_bytes(results.removed_size),
            results.deleted_volumes
        );
    }
    out.finish("purge", &results.report)
}

pub fn delete(controller: &Controller, out: &Output, version: Option<u64>) -> Result<()> {
    let results = match version {
        Some(v) => controller.delete_version(v),
        None => controller.delete(),
    }
    .context("delete failed")?;

    if out.is_json() {
        out.json(&results)?;
    } else if results.deleted_versions.is_empty() {
        println!("  Nothing to delete.");
    } else {
        println!(
            "  Deleted version(s) {:?}, {} volume(s) removed",
            results.deleted_versions, results.deleted_volumes
        );
    }
    out.finish("delete", &results.report)
}

pub fn repair(controller: &Controller, out: &Output) -> Result<()> {
    let results = controller.repair().context("repair failed")?;
    if out.is_json() {
        out.json(&results)?;
    } else if !results.recreated_versions.is_empty() {
        println!(
            "  Recreated {} version(s) from {} volume(s)",
            results.recreated_versions.len(),
            results.imported_volumes
        );
    } else {
        println!("  Re-uploaded {} file list(s)", results.uploaded_file_lists);
    }
    out.finish("repair", &results.report)
}

pub fn config_show() -> Result<()> {
    print!("{}", strata_config::config().to_toml()?);
    Ok(())
}

pub fn config_path(explicit: Option<&Path>) -> Result<()> {
    match explicit {
        Some(path) => println!("Explicit: {}", path.display()),
        None => {
            match Config::global_config_path() {
                Some(global) => println!("Global:  {}", global.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: .strata/config.toml");
        }
    }
    Ok(())
}
