use fer_convert::{ConversionOptions, ConvertError, Converter, GgmlType, GgufFile, SUCCESS_MESSAGE};
use serde_json::json;
use std::fs::{self, File};
use std::path::Path;
use std::process::Command;

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn write_safetensors(path: &Path, header: serde_json::Value, data: &[u8]) {
    let header = serde_json::to_vec(&header).unwrap();
    let mut buf = (header.len() as u64).to_le_bytes().to_vec();
    buf.extend_from_slice(&header);
    buf.extend_from_slice(data);
    fs::write(path, buf).unwrap();
}

/// A tiny classifier head: 2x3 conv kernel, 7-way bias.
fn write_small_classifier(path: &Path) -> (Vec<u8>, Vec<u8>) {
    let kernel = f32_bytes(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    let bias = f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let mut data = kernel.clone();
    data.extend_from_slice(&bias);
    write_safetensors(
        path,
        json!({
            "__metadata__": {"architecture": "mobilenet", "num_classes": "7"},
            "conv.weight": {"dtype": "F32", "shape": [2, 3], "data_offsets": [0, 24]},
            "fc.bias": {"dtype": "F32", "shape": [7], "data_offsets": [24, 52]}
        }),
        &data,
    );
    (kernel, bias)
}

fn options(dir: &Path, source: &str, output: &str) -> ConversionOptions {
    ConversionOptions {
        source: dir.join(source),
        output: dir.join(output),
        ..Default::default()
    }
}

#[test]
fn converts_valid_model_to_readable_gguf() {
    let dir = tempfile::tempdir().unwrap();
    let (kernel, bias) = write_small_classifier(&dir.path().join("mobilenet_7.safetensors"));
    let opts = options(dir.path(), "mobilenet_7.safetensors", "fer_mobilenet.gguf");

    let report = Converter::new(opts.clone()).run().unwrap();
    assert_eq!(report.tensor_count, 2);
    assert_eq!(report.parameter_count, 13);
    assert!(report.digest.starts_with("sha256:"));

    let written = fs::metadata(&opts.output).unwrap().len();
    assert!(written > 0);
    assert_eq!(written, report.bytes_written);

    let gguf = GgufFile::open(&opts.output).unwrap();
    assert_eq!(gguf.version, 3);
    assert_eq!(gguf.architecture(), Some("mobilenet"));
    assert_eq!(gguf.string("general.name"), Some("mobilenet_7"));
    assert_eq!(gguf.string("mobilenet.num_classes"), Some("7"));
    assert_eq!(gguf.uint("general.file_type"), Some(0));

    let conv = gguf.get_tensor("conv.weight").unwrap();
    assert_eq!(conv.dims, vec![3, 2]);
    assert_eq!(conv.ggml_type, GgmlType::F32);

    let mut file = File::open(&opts.output).unwrap();
    assert_eq!(gguf.tensor_data(&mut file, "conv.weight").unwrap(), kernel);
    assert_eq!(gguf.tensor_data(&mut file, "fc.bias").unwrap(), bias);
}

#[test]
fn repeated_conversion_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    write_small_classifier(&dir.path().join("model.safetensors"));

    Converter::new(options(dir.path(), "model.safetensors", "a.gguf")).run().unwrap();
    Converter::new(options(dir.path(), "model.safetensors", "b.gguf")).run().unwrap();

    let a = fs::read(dir.path().join("a.gguf")).unwrap();
    let b = fs::read(dir.path().join("b.gguf")).unwrap();
    assert_eq!(a, b);
}

#[test]
fn missing_source_fails_before_output_exists() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), "absent.safetensors", "out.gguf");

    let err = Converter::new(opts.clone()).run().unwrap_err();
    assert!(matches!(err, ConvertError::Source { .. }));
    assert!(!opts.output.exists());
}

#[test]
fn invalid_source_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("model.h5"), b"\x89HDF\r\n\x1a\n not safetensors").unwrap();
    let opts = options(dir.path(), "model.h5", "out.gguf");

    let err = Converter::new(opts.clone()).run().unwrap_err();
    assert!(matches!(err, ConvertError::InvalidSource { .. }), "{err}");
    assert!(!opts.output.exists());
}

#[test]
fn unsupported_dtype_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    write_safetensors(
        &dir.path().join("model.safetensors"),
        json!({"mask": {"dtype": "BOOL", "shape": [4], "data_offsets": [0, 4]}}),
        &[1, 0, 1, 0],
    );
    let opts = options(dir.path(), "model.safetensors", "out.gguf");

    let err = Converter::new(opts.clone()).run().unwrap_err();
    assert!(matches!(err, ConvertError::Unsupported(_)));
    assert!(!opts.output.exists());
}

#[test]
fn unwritable_destination_fails_after_conversion() {
    let dir = tempfile::tempdir().unwrap();
    write_small_classifier(&dir.path().join("model.safetensors"));
    let opts = options(dir.path(), "model.safetensors", "missing/dir/out.gguf");

    let converter = Converter::new(opts.clone());
    let model = converter.load().unwrap();
    let converted = converter.convert(&model).unwrap();
    assert!(!converted.bytes.is_empty());

    let err = converter.write(&converted).unwrap_err();
    assert!(matches!(err, ConvertError::Destination { .. }));
    assert!(!opts.output.exists());
}

#[test]
fn binary_prints_success_message() {
    let dir = tempfile::tempdir().unwrap();
    write_small_classifier(&dir.path().join("mobilenet_7.safetensors"));

    let output = Command::new(env!("CARGO_BIN_EXE_fer-convert"))
        .current_dir(dir.path())
        .env_remove("FER_CONVERT_SOURCE")
        .env_remove("FER_CONVERT_OUTPUT")
        .env("RUST_LOG", "off")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), format!("{SUCCESS_MESSAGE}\n"));
    assert!(fs::metadata(dir.path().join("fer_mobilenet.gguf")).unwrap().len() > 0);
}

#[test]
fn binary_exits_nonzero_on_missing_source() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_fer-convert"))
        .current_dir(dir.path())
        .args(["convert", "nope.safetensors", "out.gguf"])
        .env("RUST_LOG", "off")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
    assert!(!dir.path().join("out.gguf").exists());
}

fn fer_convert(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fer-convert"));
    cmd.current_dir(dir)
        .env_remove("FER_CONVERT_SOURCE")
        .env_remove("FER_CONVERT_OUTPUT")
        .env("RUST_LOG", "off");
    cmd
}

#[test]
fn inspect_reports_parse_failure_reason() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("bad.gguf"), b"GGML\x03\x00\x00\x00\x00\x00\x00\x00").unwrap();

    let output = fer_convert(dir.path()).args(["inspect", "bad.gguf"]).output().unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("parsing bad.gguf"), "{stderr}");
    assert!(stderr.contains("Invalid GGUF magic"), "{stderr}");
}

#[test]
fn inspect_json_lists_converted_tensors() {
    let dir = tempfile::tempdir().unwrap();
    write_small_classifier(&dir.path().join("model.safetensors"));
    Converter::new(options(dir.path(), "model.safetensors", "model.gguf")).run().unwrap();

    let output = fer_convert(dir.path())
        .args(["inspect", "model.gguf", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["version"], 3);
    assert_eq!(summary["architecture"], "mobilenet");
    assert_eq!(summary["parameter_count"], 13);
    assert_eq!(
        summary["tensors"],
        json!([
            {"name": "conv.weight", "ggml_type": "F32", "dims": [3, 2], "size": 24},
            {"name": "fc.bias", "ggml_type": "F32", "dims": [7], "size": 28}
        ])
    );
}

#[test]
fn inspect_text_summary() {
    let dir = tempfile::tempdir().unwrap();
    write_small_classifier(&dir.path().join("model.safetensors"));
    Converter::new(options(dir.path(), "model.safetensors", "model.gguf")).run().unwrap();

    let output = fer_convert(dir.path()).args(["inspect", "model.gguf"]).output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("GGUF version: 3"), "{stdout}");
    assert!(stdout.contains("Architecture: mobilenet"), "{stdout}");
    assert!(stdout.contains("Tensors:      2"), "{stdout}");
    assert!(stdout.contains("conv.weight"), "{stdout}");
}

#[test]
fn env_overrides_default_paths() {
    let dir = tempfile::tempdir().unwrap();
    write_small_classifier(&dir.path().join("custom.safetensors"));

    let output = fer_convert(dir.path())
        .env("FER_CONVERT_SOURCE", "custom.safetensors")
        .env("FER_CONVERT_OUTPUT", "from_env.gguf")
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(GgufFile::open(dir.path().join("from_env.gguf")).is_ok());
    assert!(!dir.path().join("fer_mobilenet.gguf").exists());
}

#[test]
fn cli_arguments_win_over_env() {
    let dir = tempfile::tempdir().unwrap();
    write_small_classifier(&dir.path().join("model.safetensors"));

    let output = fer_convert(dir.path())
        .env("FER_CONVERT_SOURCE", "absent.safetensors")
        .env("FER_CONVERT_OUTPUT", "from_env.gguf")
        .args(["convert", "model.safetensors", "from_cli.gguf"])
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(dir.path().join("from_cli.gguf").exists());
    assert!(!dir.path().join("from_env.gguf").exists());
}
