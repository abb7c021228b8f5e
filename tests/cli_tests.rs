use clap::Parser;
use seqengine::cli::{validate_device, Args};
use std::path::PathBuf;

fn devices() -> Vec<String> {
    vec!["Mock Device 1".to_string(), "USB Synth:0".to_string()]
}

#[test]
fn test_args_defaults() {
    let args = Args::parse_from(["seqengine"]);
    assert!(!args.device_list);
    assert!(!args.metronome);
    assert_eq!(args.connect, None);
    assert_eq!(args.tempo, None);
    assert_eq!(args.export, None);
    assert_eq!(args.bars, 4);
}

#[test]
fn test_args_with_overrides() {
    let args = Args::parse_from([
        "seqengine",
        "--connect",
        "USB Synth",
        "--tempo",
        "96.5",
        "--read-ahead",
        "2048",
        "--metronome",
        "--bars",
        "8",
        "--export",
        "out.mid",
    ]);
    assert_eq!(args.connect.as_deref(), Some("USB Synth"));
    assert_eq!(args.tempo, Some(96.5));
    assert_eq!(args.read_ahead, Some(2048));
    assert!(args.metronome);
    assert_eq!(args.bars, 8);
    assert_eq!(args.export, Some(PathBuf::from("out.mid")));
}

#[test]
fn test_valid_device() {
    assert!(validate_device("USB Synth", &devices()).is_ok());
}

#[test]
fn test_invalid_device_lists_alternatives() {
    let error = validate_device("Nonexistent Device", &devices()).unwrap_err();
    assert!(error.contains("Nonexistent Device"));
    assert!(error.contains("  - Mock Device 1"));
    assert!(error.contains("  - USB Synth:0"));
}
