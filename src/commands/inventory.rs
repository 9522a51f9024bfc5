use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::InventoryArgs;
use crate::model::{ReportEntry, ReportInventoryManifest, ReportKind};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

pub fn run(args: InventoryArgs) -> Result<()> {
    let reports_dir = resolve_reports_dir(&args.cache_root, args.reports_dir.as_deref());
    let manifest = build_manifest(&reports_dir)?;

    if args.dry_run {
        info!(
            report_count = manifest.report_count,
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args
        .manifest_path
        .unwrap_or_else(|| default_manifest_path(&args.cache_root));

    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote inventory manifest");
    info!(report_count = manifest.report_count, "inventory completed");

    Ok(())
}

pub fn resolve_reports_dir(cache_root: &Path, reports_dir: Option<&Path>) -> PathBuf {
    reports_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cache_root.join("reports"))
}

pub fn default_manifest_path(cache_root: &Path) -> PathBuf {
    cache_root.join("manifests").join("report_inventory.json")
}

pub fn build_manifest(reports_dir: &Path) -> Result<ReportInventoryManifest> {
    let mut report_paths = discover_reports(reports_dir)?;
    report_paths.sort_by(|a, b| a.1.cmp(&b.1));

    if report_paths.is_empty() {
        bail!(
            "no report files (.txt or .pdf) found in {}",
            reports_dir.display()
        );
    }

    let mut reports = Vec::with_capacity(report_paths.len());
    for (kind, path) in report_paths {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;

        let sha256 = sha256_file(&path)?;

        reports.push(ReportEntry {
            filename,
            kind,
            sha256,
        });
    }

    Ok(ReportInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: reports_dir.display().to_string(),
        report_count: reports.len(),
        reports,
    })
}

fn discover_reports(reports_dir: &Path) -> Result<Vec<(ReportKind, PathBuf)>> {
    let mut reports = Vec::new();

    let entries = fs::read_dir(reports_dir)
        .with_context(|| format!("failed to read {}", reports_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", reports_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let Some(kind) = report_kind_for(&path) else {
            continue;
        };

        reports.push((kind, path));
    }

    Ok(reports)
}

fn report_kind_for(path: &Path) -> Option<ReportKind> {
    let extension = path.extension().and_then(|ext| ext.to_str())?;

    if extension.eq_ignore_ascii_case("txt") || extension.eq_ignore_ascii_case("eml") {
        Some(ReportKind::Text)
    } else if extension.eq_ignore_ascii_case("pdf") {
        Some(ReportKind::Pdf)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn temp_reports_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("agrisignals-inventory-{name}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn build_manifest_lists_txt_and_pdf_sorted_by_name() {
        let dir = temp_reports_dir("sorted");
        write_file(&dir, "b_weekly.txt", "upcoming sales");
        write_file(&dir, "a_sale.pdf", "%PDF-1.4 fake");
        write_file(&dir, "notes.md", "ignored");

        let manifest = build_manifest(&dir).unwrap();
        assert_eq!(manifest.report_count, 2);
        assert_eq!(manifest.reports[0].filename, "a_sale.pdf");
        assert_eq!(manifest.reports[0].kind, ReportKind::Pdf);
        assert_eq!(manifest.reports[1].filename, "b_weekly.txt");
        assert_eq!(manifest.reports[1].kind, ReportKind::Text);
        assert_eq!(manifest.reports[0].sha256.len(), 64);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn build_manifest_fails_on_empty_directory() {
        let dir = temp_reports_dir("empty");
        assert!(build_manifest(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
