//! CLI test cases.
//!
//! Tests which actually read PDFs need Poppler (`pdfinfo`, `pdffonts`,
//! `pdftotext`, `pdftocairo`) and `tesseract` on the PATH, so they are
//! ignored by default. Run them with `cargo test -- --ignored`.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// A two-page PDF. Page 1 has a text layer, page 2 is a black rectangle.
static REPORT_PDF: &str = "tests/fixtures/report.pdf";

/// Create a new `Command` with our binary, using `data_dir` for storage.
fn cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pdf-page-ocr").unwrap();
    cmd.arg("--data-dir")
        .arg(data_dir.path())
        .env_remove("OPENAI_API_KEY")
        .env_remove("OPENAI_API_BASE");
    cmd
}

fn data_dir() -> TempDir {
    TempDir::with_prefix("pdf-page-ocr-cli").unwrap()
}

#[test]
fn test_help() {
    cmd(&data_dir()).arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd(&data_dir()).arg("--version").assert().success();
}

#[test]
fn test_list_empty() {
    cmd(&data_dir())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_text_missing_document() {
    cmd(&data_dir())
        .args(["text", "missing.pdf", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_import_rejects_non_pdf() {
    let dir = data_dir();
    let path = dir.path().join("notes.pdf");
    std::fs::write(&path, "just some text").unwrap();
    cmd(&dir)
        .arg("import")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not look like a PDF"));
}

#[test]
fn test_export_needs_pages() {
    cmd(&data_dir())
        .args(["export", "report.pdf"])
        .assert()
        .failure();
}

#[test]
#[ignore = "Needs poppler-utils and tesseract installed"]
fn test_import_text_export_delete() {
    let dir = data_dir();
    cmd(&dir)
        .arg("import")
        .arg(REPORT_PDF)
        .assert()
        .success()
        .stdout(predicate::str::contains("report.pdf"));

    cmd(&dir)
        .args(["text", "report.pdf", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Revenue grew 5% powered by efficiency gains",
        ));

    // Page 2 has no text layer, so this goes through OCR.
    cmd(&dir)
        .args(["text", "report.pdf", "1", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("=== Page 2 ==="));

    cmd(&dir)
        .args(["export", "report.pdf", "1", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("report_pages_1_2.txt"));

    cmd(&dir).args(["delete", "report.pdf"]).assert().success();
    cmd(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
#[ignore = "Needs poppler-utils installed"]
fn test_edit_then_refine_without_api() {
    let dir = data_dir();
    cmd(&dir).arg("import").arg(REPORT_PDF).assert().success();

    assert_cmd::Command::from_std(cmd(&dir))
        .args(["edit", "report.pdf", "1"])
        .write_stdin("hand- written\ntext")
        .assert()
        .success();

    // With no API configured, refinement falls back to normalized text.
    cmd(&dir)
        .args(["refine", "report.pdf", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("handwritten text"));
}

#[test]
#[ignore = "Needs poppler-utils installed"]
fn test_sqlite_store() {
    let dir = data_dir();
    cmd(&dir).arg("import").arg(REPORT_PDF).assert().success();
    for _ in 0..2 {
        cmd(&dir)
            .args(["--store", "sqlite", "text", "report.pdf", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Revenue grew 5%"));
    }
    assert!(dir.path().join("ocr_data.db").exists());
}
