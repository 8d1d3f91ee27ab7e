//! Combine → split round-trip over real files on disk.

use similar_asserts::assert_eq;

use libzipfs::{
    combiner::{combine, CombinerConfig},
    footer::{read_footer, FOOTER_LEN},
    splitter::{split, SplitError},
    test::{sample_exe, sample_zip, tempdir, write_fixture},
};

#[test]
fn test_combine_split_roundtrip() {
    let dir = tempdir();
    let exe = sample_exe(65_536);
    let zip = sample_zip();

    let cfg = CombinerConfig {
        executable_path: write_fixture(dir.path(), "tester", &exe),
        zipfile_path: write_fixture(dir.path(), "hi.zip", &zip),
        output_path: dir.path().join("combined"),
        split: false,
    };
    cfg.validate().unwrap();
    let footer = combine(&cfg).unwrap();

    assert_eq!(footer.executable_length.get() as usize, exe.len());
    assert_eq!(footer.zipfile_length.get() as usize, zip.len());
    assert_eq!(footer.footer_length.get() as usize, FOOTER_LEN);

    // the combo's trailing footer reads back field-for-field
    let (footer_start, read_back, _file) = read_footer(&cfg.output_path).unwrap();
    assert_eq!(footer_start as usize, exe.len() + zip.len());
    assert_eq!(read_back, footer);

    // splitting recovers both inputs bit-exact, and the same footer
    let split_cfg = CombinerConfig {
        executable_path: dir.path().join("tester.out"),
        zipfile_path: dir.path().join("hi.zip.out"),
        output_path: cfg.output_path.clone(),
        split: true,
    };
    split_cfg.validate().unwrap();
    let recovered = split(&split_cfg).unwrap();

    assert_eq!(recovered, footer);
    assert_eq!(std::fs::read(&split_cfg.executable_path).unwrap(), exe);
    assert_eq!(std::fs::read(&split_cfg.zipfile_path).unwrap(), zip);
}

#[test]
fn test_corruption_anywhere_fails_split() {
    let dir = tempdir();
    let exe = sample_exe(4096);
    let zip = sample_zip();

    let cfg = CombinerConfig {
        executable_path: write_fixture(dir.path(), "tester", &exe),
        zipfile_path: write_fixture(dir.path(), "hi.zip", &zip),
        output_path: dir.path().join("combined"),
        split: false,
    };
    combine(&cfg).unwrap();
    let pristine = std::fs::read(&cfg.output_path).unwrap();

    // one corruption per region: executable, zipfile, footer
    let cases: [(&str, usize, fn(&SplitError) -> bool); 3] = [
        ("exe", 100, |err: &SplitError| {
            matches!(err, SplitError::ChecksumMismatch { region: "executable", .. })
        }),
        ("zip", exe.len() + 10, |err: &SplitError| {
            matches!(err, SplitError::ChecksumMismatch { region: "zipfile", .. })
        }),
        ("footer", pristine.len() - 50, |err: &SplitError| {
            matches!(err, SplitError::Footer { .. })
        }),
    ];

    for (label, position, is_expected) in cases {
        let mut tampered = pristine.clone();
        tampered[position] ^= 0x01;
        std::fs::write(&cfg.output_path, &tampered).unwrap();

        let split_cfg = CombinerConfig {
            executable_path: dir.path().join(format!("exe.{label}")),
            zipfile_path: dir.path().join(format!("zip.{label}")),
            output_path: cfg.output_path.clone(),
            split: true,
        };
        let err = split(&split_cfg).unwrap_err();
        assert!(
            is_expected(&err),
            "corrupting the {label} region at byte {position} gave: {err}"
        );
    }
}
