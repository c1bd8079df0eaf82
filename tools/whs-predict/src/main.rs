//! 全心分割批量预测.
//!
//! ```bash
//! whs-predict --image ~/dataset/whs --output ~/dataset/whs/pred \
//!     --model ~/dataset/whs/models --view 0 1 2 --modality ct mr --mode validation
//! ```
//!
//! 对每个模态, 依次预测 `{image}/{modality}_test` 下的全部体数据, 预测结果以原文件名
//! 写到 `{output}` 下. 验证模式下同时写出 `{output}/{模型目录名}_test-{modality}.csv`.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use heart_berry::prelude::*;
use log::LevelFilter;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FusionArg {
    /// 概率平均.
    Average,
    /// 多数投票.
    Vote,
    /// 只用第一个模型.
    Single,
}

impl From<FusionArg> for FusionPolicy {
    fn from(f: FusionArg) -> Self {
        match f {
            FusionArg::Average => FusionPolicy::Average,
            FusionArg::Vote => FusionPolicy::MajorityVote,
            FusionArg::Single => FusionPolicy::Single,
        }
    }
}

/// Whole heart segmentation with a multi-view 2D network ensemble
#[derive(Parser, Debug)]
#[command(name = "whs-predict")]
#[command(version, about, long_about = None)]
struct Args {
    /// Dataset folder containing `{modality}_test[_masks]` folders (default: $WHS_DATA_DIR)
    #[arg(long)]
    image: Option<PathBuf>,

    /// Output folder for predictions and reports
    #[arg(long)]
    output: PathBuf,

    /// Folder containing the trained models (default: $WHS_MODEL_DIR)
    #[arg(long)]
    model: Option<PathBuf>,

    /// Views to use: 0 axial, 1 coronal, 2 sagittal
    #[arg(long, num_args = 1.., default_values_t = [0usize, 1, 2])]
    view: Vec<usize>,

    /// Modalities to process
    #[arg(long, num_args = 1.., default_values = ["ct", "mr"])]
    modality: Vec<Modality>,

    /// `test` (no ground truth) or `validation` (with ground truth)
    #[arg(long, default_value = "test")]
    mode: RunMode,

    /// Fusion policy
    #[arg(long, value_enum, default_value_t = FusionArg::Average)]
    fusion: FusionArg,

    /// Canonical slice size fed to the networks
    #[arg(long, default_value_t = 256)]
    size: usize,

    /// Number of sequential sub-batches per slice stack
    #[arg(long, default_value_t = NonZeroUsize::new(2).unwrap_or(NonZeroUsize::MIN))]
    partitions: NonZeroUsize,

    /// Model file name postfix: weights_multi-all-{view}_{postfix}.onnx
    #[arg(long, default_value = "small2")]
    postfix: String,

    /// Worker threads for resampling (default: all cores)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn level(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => LevelFilter::Warn,
            (false, 0) => LevelFilter::Info,
            (false, 1) => LevelFilter::Debug,
            (false, _) => LevelFilter::Trace,
        }
    }

    fn views(&self) -> anyhow::Result<Vec<View>> {
        self.view
            .iter()
            .map(|a| View::from_axis(*a).with_context(|| format!("invalid view axis {a}, expected 0, 1 or 2")))
            .collect()
    }
}

/// 预测单个体数据. 返回评分 (若有真值).
fn run_case(
    ensemble: &Ensemble,
    config: &EnsembleConfig,
    case: &Case,
    out_dir: &Path,
    mode: RunMode,
) -> PredictResult<Option<DiceScores>> {
    let mut prediction = Prediction::new(ensemble, config, &case.image, case.label.clone());
    prediction.resample_prediction()?;
    let scores = if mode.with_ground_truth() {
        match prediction.dice() {
            Ok(s) => Some(s),
            Err(e) if e.is_recoverable() => {
                log::warn!("{e}");
                None
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };
    prediction.write(out_dir.join(case.file_name()))?;
    Ok(scores)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(args.level())
        .init()
        .context("failed to install logger")?;

    let jobs = args.jobs.unwrap_or_else(utils::cpus).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build_global()
        .context("failed to build thread pool")?;

    let data_dir = match args.image.clone() {
        Some(d) => d,
        None => utils::loader::data_dir_from_env_or_home().context("cannot locate dataset folder")?,
    };
    let model_dir = match args.model.clone() {
        Some(d) => d,
        None => utils::loader::model_dir_from_env_or_home().context("cannot locate model folder")?,
    };
    let model_dir = model_dir.canonicalize().unwrap_or(model_dir);
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("cannot create output folder {}", args.output.display()))?;

    let views = args.views()?;
    let spec = EnsembleSpec::from_model_dir(&model_dir, &views, &args.postfix, "onnx")?;
    let ensemble = Ensemble::load(&spec, &OnnxLoader)?;
    log::info!("loaded {} models for views {:?}", ensemble.len(), ensemble.distinct_views());

    let mut failed = 0usize;
    for modality in args.modality.iter().copied() {
        let config = EnsembleConfig::new(modality)
            .with_canonical_size(args.size)
            .with_fusion(args.fusion.into())
            .with_partitions(args.partitions);
        let cases = utils::loader::case_loader(&data_dir, modality, args.mode)
            .with_context(|| format!("cannot list {modality} volumes under {}", data_dir.display()))?;

        let mut dice_rows = Vec::with_capacity(cases.len());
        for case in cases {
            utils::sep();
            log::info!("processing {}", case.image.display());
            match run_case(&ensemble, &config, &case, &args.output, args.mode) {
                Ok(Some(scores)) => dice_rows.push(scores),
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    log::error!("skipping {}: {e}", case.image.display());
                }
            }
        }

        if !dice_rows.is_empty() {
            let path = report_path(&args.output, &model_dir, modality);
            write_dice_report(&path, &dice_rows)?;
            log::info!("wrote dice report {}", path.display());
        }
    }

    if failed != 0 {
        bail!("{failed} volumes failed");
    }
    Ok(())
}
