//! `he-infer-client`: submit one batch to a remote encrypted-inference
//! engine and report the class scores.
//!
//! ```text
//! he-infer-client \
//!   --input batch.json \          # {"shape": [N, 28, 28], "data": [...]}
//!   --labels labels.json \        # [7, 2, 1, ...] or one-hot rows
//!   --hostname localhost --port 34000 \
//!   --encrypt_server_data=yes \
//!   --batch_size 64 \
//!   --complex_packing
//! ```
//!
//! Flags left unset fall back to the `HE_*` environment variables
//! (`HE_BACKEND`, `HE_SEAL_CONFIG`, `HE_ENABLE_CLIENT`, `HE_ENCRYPT_DATA`,
//! `HE_BATCH_DATA`, `HE_COMPLEX_PACK`).

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::Parser;
use ndarray::{Array2, ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use he_infer::accuracy::{labels_from_one_hot, AccuracyEvaluator, AccuracyReport};
use he_infer::channel::{ConnectOptions, RetryPolicy};
use he_infer::client::{InferenceClient, PollPolicy};
use he_infer::config::{parse_flag, EncryptionConfigBuilder};
use he_infer::layout::{FlattenOrder, ScoreLayout};
use he_infer::packing::BatchPacker;
use he_infer::params::ParameterSource;
use he_infer::protocol::{InferenceRequest, InferenceResult, DEFAULT_PORT};
use he_infer::unpacking::ResultUnpacker;

fn parse_bool_flag(value: &str) -> Result<bool, String> {
    parse_flag("flag", value).map_err(|e| e.to_string())
}

/// he-infer-client: batched encrypted-inference client.
#[derive(Parser, Debug)]
#[command(name = "he-infer-client", version, about)]
struct Cli {
    /// JSON input file: {"shape": [batch, ...], "data": [row-major values]}.
    #[arg(long)]
    input: PathBuf,

    /// Ground-truth labels: JSON array of class indices or of one-hot rows.
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Number of leading examples to send (default: the whole input).
    #[arg(long = "batch_size")]
    batch_size: Option<usize>,

    #[arg(long, default_value = "localhost")]
    hostname: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Backend name (default: HE_BACKEND or HE_SEAL).
    #[arg(long)]
    backend: Option<String>,

    /// Encryption parameters: path to a JSON file or inline JSON.
    #[arg(long = "encryption_parameters")]
    encryption_parameters: Option<String>,

    /// Client supplies its input interactively (encrypted client-side).
    #[arg(long = "enable_client", value_parser = parse_bool_flag, num_args = 0..=1, default_missing_value = "true")]
    enable_client: Option<bool>,

    /// Server encrypts the input tensor.
    #[arg(long = "encrypt_server_data", alias = "encrypt_data", value_parser = parse_bool_flag, num_args = 0..=1, default_missing_value = "true")]
    encrypt_server_data: Option<bool>,

    /// Pack the batch axis into ciphertext slots.
    #[arg(long = "pack_data", value_parser = parse_bool_flag, num_args = 0..=1, default_missing_value = "true")]
    pack_data: Option<bool>,

    /// Pack two examples per slot (real and imaginary parts).
    #[arg(long = "complex_packing", value_parser = parse_bool_flag, num_args = 0..=1, default_missing_value = "true")]
    complex_packing: Option<bool>,

    /// Name of the input tensor in the remote graph.
    #[arg(long = "tensor_name", default_value = "import/input")]
    tensor_name: String,

    /// Output tensor to read scores from (default: the only output).
    #[arg(long = "output_name")]
    output_name: Option<String>,

    /// Element order for packing: row_major (C), column_major (F), native (A).
    #[arg(long, default_value = "row_major")]
    order: FlattenOrder,

    /// Layout of reported score matrices: batch_by_class or class_by_batch.
    #[arg(long = "result_layout", default_value = "batch_by_class")]
    result_layout: ScoreLayout,

    #[arg(long = "poll_interval_ms", default_value = "1000")]
    poll_interval_ms: u64,

    /// Give up waiting for the result after this many seconds.
    #[arg(long = "timeout_secs")]
    timeout_secs: Option<u64>,

    /// Extra connection attempts after the first one fails.
    #[arg(long = "connect_retries", default_value = "0")]
    connect_retries: u32,

    #[arg(long = "retry_backoff_ms", default_value = "2000")]
    retry_backoff_ms: u64,

    /// Print a JSON summary instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Deserialize)]
struct InputFile {
    shape: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Serialize)]
struct Summary<'a> {
    request_id: &'a str,
    output: &'a str,
    result_layout: ScoreLayout,
    predictions: Vec<usize>,
    scores: Vec<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    accuracy: Option<&'a AccuracyReport>,
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    process::exit(1);
}

fn load_input(path: &Path, batch_size: Option<usize>) -> ArrayD<f64> {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("cannot read input file '{}': {e}", path.display())));
    let input: InputFile = serde_json::from_str(&text)
        .unwrap_or_else(|e| fail(format!("invalid JSON input (expected {{shape, data}}): {e}")));
    let batch = ArrayD::from_shape_vec(IxDyn(&input.shape), input.data)
        .unwrap_or_else(|e| fail(format!("input data does not match shape {:?}: {e}", input.shape)));
    let available = batch.shape().first().copied().unwrap_or(0);
    match batch_size {
        Some(n) if n > available => fail(format!(
            "--batch_size {n} exceeds the {available} examples in the input"
        )),
        Some(n) => batch.slice_axis(Axis(0), Slice::from(..n)).to_owned(),
        None => batch,
    }
}

fn load_labels(path: &Path) -> Vec<usize> {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("cannot read labels file '{}': {e}", path.display())));
    parse_labels(&text).unwrap_or_else(|e| fail(e))
}

/// Class indices, or one-hot rows of equal length.
fn parse_labels(text: &str) -> Result<Vec<usize>, String> {
    if let Ok(labels) = serde_json::from_str::<Vec<usize>>(text) {
        return Ok(labels);
    }
    let rows: Vec<Vec<f64>> = serde_json::from_str(text)
        .map_err(|e| format!("invalid labels (expected class indices or one-hot rows): {e}"))?;
    let classes = rows.first().map(Vec::len).unwrap_or(0);
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != classes) {
        return Err(format!(
            "one-hot label row {i} has {} entries, expected {classes}",
            row.len()
        ));
    }
    let examples = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let one_hot = Array2::from_shape_vec((examples, classes), flat)
        .map_err(|e| format!("invalid one-hot labels: {e}"))?;
    labels_from_one_hot(&one_hot).map_err(|e| e.to_string())
}

/// Keep the labels of the examples actually sent.
fn align_labels(mut labels: Vec<usize>, batch_size: usize) -> Result<Vec<usize>, String> {
    if labels.len() < batch_size {
        return Err(format!(
            "{} labels supplied for a batch of {batch_size} examples",
            labels.len()
        ));
    }
    labels.truncate(batch_size);
    Ok(labels)
}

fn pick_output<'a>(result: &'a InferenceResult, name: Option<&'a str>) -> &'a str {
    match name {
        Some(name) => name,
        None => {
            let mut names = result.outputs.keys();
            match (names.next(), names.next()) {
                (Some(only), None) => only.as_str(),
                (None, _) => fail("result has no outputs"),
                _ => fail(format!(
                    "result has several outputs ({}); pick one with --output_name",
                    result.outputs.keys().cloned().collect::<Vec<_>>().join(", ")
                )),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Configuration ──
    let mut builder = EncryptionConfigBuilder::from_env().unwrap_or_else(|e| fail(e));
    if let Some(backend) = &cli.backend {
        builder = builder.backend(backend.as_str());
    }
    if let Some(source) = &cli.encryption_parameters {
        builder = builder.encryption_parameters(ParameterSource::parse(source));
    }
    if let Some(on) = cli.enable_client {
        builder = builder.enable_client(on);
    }
    if let Some(on) = cli.encrypt_server_data {
        builder = builder.encrypt_server_data(on);
    }
    if let Some(on) = cli.pack_data {
        builder = builder.pack_data(on);
    }
    if let Some(on) = cli.complex_packing {
        builder = builder.complex_packing(on);
    }
    let config = builder
        .input_tensor(cli.tensor_name.as_str())
        .result_layout(cli.result_layout)
        .build_shared()
        .unwrap_or_else(|e| fail(e));

    // ── Packing ──
    let batch = load_input(&cli.input, cli.batch_size);
    let packed = BatchPacker::new(cli.order, config.packing_factor())
        .pack(&batch)
        .unwrap_or_else(|e| fail(e));
    let batch_size = packed.meta.batch_size;
    let labels = cli
        .labels
        .as_deref()
        .map(|path| align_labels(load_labels(path), batch_size).unwrap_or_else(|e| fail(e)));
    let meta = packed.meta.clone();
    let request = InferenceRequest::new(batch_size, config.clone())
        .with_tensor(cli.tensor_name.as_str(), packed)
        .unwrap_or_else(|e| fail(e));

    // ── Inference ──
    let options = ConnectOptions {
        retry: RetryPolicy::new(
            cli.connect_retries.saturating_add(1),
            Duration::from_millis(cli.retry_backoff_ms),
        ),
        connect_timeout: None,
    };
    let policy = PollPolicy {
        interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
        timeout: cli.timeout_secs.map(Duration::from_secs),
    };
    let mut client: InferenceClient = InferenceClient::new();
    client
        .connect_with(&cli.hostname, cli.port, &options)
        .await
        .unwrap_or_else(|e| fail(e));
    let result = client.run(request, &policy).await.unwrap_or_else(|e| fail(e));
    if let Err(e) = client.close().await {
        tracing::warn!(error = %e, "goodbye not delivered");
    }

    // ── Unpacking & evaluation ──
    let output = pick_output(&result, cli.output_name.as_deref());
    let slots = &result.outputs[output];
    let values = slots.value_count();
    if values == 0 || values % batch_size != 0 {
        fail(format!(
            "output '{output}' carries {values} values, not a multiple of batch size {batch_size}"
        ));
    }
    let unpacker = ResultUnpacker::from_meta(&meta, values / batch_size).unwrap_or_else(|e| fail(e));
    let scores = unpacker
        .unpack_output(&result, output)
        .unwrap_or_else(|e| fail(e));
    let reported = match config.result_layout() {
        ScoreLayout::BatchByClass => scores.view(),
        ScoreLayout::ClassByBatch => scores.t(),
    };
    let report = labels.map(|labels| {
        AccuracyEvaluator::new(config.result_layout())
            .evaluate(&reported, &labels)
            .unwrap_or_else(|e| fail(e))
    });

    let predictions: Vec<usize> = scores
        .rows()
        .into_iter()
        .map(|row| he_infer::accuracy::top_k(&row.to_vec(), 1).first().copied().unwrap_or(0))
        .collect();

    if cli.json {
        let summary = Summary {
            request_id: &result.request_id,
            output,
            result_layout: config.result_layout(),
            predictions,
            scores: reported.rows().into_iter().map(|r| r.to_vec()).collect(),
            accuracy: report.as_ref(),
        };
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(e) => fail(e),
        }
    } else {
        println!("request {} ({} examples)", result.request_id, batch_size);
        for (i, class) in predictions.iter().enumerate() {
            println!("  example {i:>4}: class {class}");
        }
        if let Some(report) = &report {
            println!("{report}");
        }
    }
}
