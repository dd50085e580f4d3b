// src/extractors/archive.rs

// --- Imports ---
use crate::utils::error::ResolutionError;
use chrono::NaiveDate;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Sibling document type bundled in the same container; never the FRE body.
const REGISTRATION_FORM_MARKER: &str = "FormularioCadastral";

/// Builds the expected member name fragment for a filing,
/// e.g. `014206FRE31-12-2024v6`.
pub fn expected_member_pattern(cod_cvm: u32, reference_date: NaiveDate, version: u32) -> String {
    format!(
        "{:06}FRE{}v{}",
        cod_cvm,
        reference_date.format("%d-%m-%Y"),
        version
    )
}

/// Locates the FRE XML member inside a downloaded filing container and
/// extracts it into `dest_dir`.
///
/// A member matches when its name contains the expected pattern and does
/// not contain the registration-form marker. If several members match
/// (not expected in practice), the lexicographically smallest name wins
/// so resolution stays deterministic; the ambiguity is logged.
pub fn extract_filing_xml(
    archive_path: &Path,
    cod_cvm: u32,
    reference_date: NaiveDate,
    version: u32,
    dest_dir: &Path,
) -> Result<PathBuf, ResolutionError> {
    let pattern = expected_member_pattern(cod_cvm, reference_date, version);
    tracing::info!(
        "Resolving FRE XML in {} with pattern {}",
        archive_path.display(),
        pattern
    );

    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut matches: Vec<String> = archive
        .file_names()
        .filter(|name| {
            name.ends_with(".xml")
                && name.contains(&pattern)
                && !name.contains(REGISTRATION_FORM_MARKER)
        })
        .map(String::from)
        .collect();
    matches.sort();

    if matches.len() > 1 {
        tracing::warn!(
            "Ambiguous resolution: {} members match {}, keeping first lexical match",
            matches.len(),
            pattern
        );
    }

    let member_name = matches
        .into_iter()
        .next()
        .ok_or(ResolutionError::MemberNotFound(pattern))?;

    let mut member = archive.by_name(&member_name)?;

    // Member names may carry directory components; flatten to a bare file
    // name inside the issuer directory.
    let file_name = Path::new(&member_name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&member_name));
    let out_path = dest_dir.join(file_name);

    let mut out = File::create(&out_path)?;
    io::copy(&mut member, &mut out)?;

    tracing::info!("Extracted FRE XML: {}", out_path.display());
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn refer_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
    }

    fn write_archive(path: &Path, members: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, content) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn pattern_zero_pads_and_formats_date() {
        assert_eq!(
            expected_member_pattern(14206, refer_date(), 6),
            "014206FRE31-12-2024v6"
        );
    }

    #[test]
    fn resolves_matching_member_and_skips_registration_form() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("filing.zip");
        write_archive(
            &archive_path,
            &[
                (
                    "FormularioCadastral014206FRE31-12-2024v6.xml",
                    b"<cadastral/>".as_slice(),
                ),
                ("014206FRE31-12-2024v6.xml", b"<fre/>".as_slice()),
                ("readme.txt", b"not xml".as_slice()),
            ],
        );

        let out = extract_filing_xml(&archive_path, 14206, refer_date(), 6, tmp.path()).unwrap();
        assert!(out.ends_with("014206FRE31-12-2024v6.xml"));
        assert_eq!(std::fs::read(&out).unwrap(), b"<fre/>");
    }

    #[test]
    fn missing_member_is_a_resolution_error() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("filing.zip");
        write_archive(
            &archive_path,
            &[("014206FRE31-12-2024v5.xml", b"<fre/>".as_slice())],
        );

        // Version mismatch: v6 requested, only v5 present.
        let err = extract_filing_xml(&archive_path, 14206, refer_date(), 6, tmp.path())
            .expect_err("should not resolve");
        assert!(matches!(err, ResolutionError::MemberNotFound(p) if p == "014206FRE31-12-2024v6"));
    }

    #[test]
    fn registration_form_alone_never_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("filing.zip");
        write_archive(
            &archive_path,
            &[(
                "FormularioCadastral014206FRE31-12-2024v6.xml",
                b"<cadastral/>".as_slice(),
            )],
        );

        let err = extract_filing_xml(&archive_path, 14206, refer_date(), 6, tmp.path())
            .expect_err("registration form must be excluded");
        assert!(matches!(err, ResolutionError::MemberNotFound(_)));
    }

    #[test]
    fn ambiguous_matches_pick_first_lexical_name() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("filing.zip");
        write_archive(
            &archive_path,
            &[
                ("b_014206FRE31-12-2024v6.xml", b"<second/>".as_slice()),
                ("a_014206FRE31-12-2024v6.xml", b"<first/>".as_slice()),
            ],
        );

        let out = extract_filing_xml(&archive_path, 14206, refer_date(), 6, tmp.path()).unwrap();
        assert!(out.ends_with("a_014206FRE31-12-2024v6.xml"));
        assert_eq!(std::fs::read(&out).unwrap(), b"<first/>");
    }

    #[test]
    fn member_paths_are_flattened_into_dest_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("filing.zip");
        write_archive(
            &archive_path,
            &[("nested/dir/014206FRE31-12-2024v6.xml", b"<fre/>".as_slice())],
        );

        let dest = tmp.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        let out = extract_filing_xml(&archive_path, 14206, refer_date(), 6, &dest).unwrap();
        assert_eq!(out, dest.join("014206FRE31-12-2024v6.xml"));
        assert!(out.is_file());
    }
}
