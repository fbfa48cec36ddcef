// ============================================================================
// paintcore CLI — headless batch filtering via command-line arguments
// ============================================================================
//
// Usage examples:
//   paintcore -i photo.png -f blur:5 -f grayscale -o out.png
//   paintcore -i photo.png -f invert --select ellipse:50,50,20,20 -o out.png
//   paintcore -i "shots/*.jpg" -f sepia --output-dir processed/ --format png
//   paintcore -i doc.pcp -f sharpen -o doc_sharp.pcp
//   paintcore -i scan.png -t rotate_cw -t crop:10,10,200,150 -o fixed.png

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use crate::error::{EngineError, Result};
use crate::filters::FilterSpec;
use crate::io::{self, ImageCodec};
use crate::log_warn;
use crate::logger::{LogTelemetry, SessionLog, SharedTelemetry};
use crate::project::Project;
use crate::selection::{SelectionMode, SelectionShape};
use crate::settings::EngineSettings;
use crate::transform::CanvasTransform;
use crate::worker::{FilterJobs, JobOutcome};

/// paintcore headless image processor.
#[derive(Parser, Debug)]
#[command(
    name = "paintcore",
    about = "Layer compositing engine: batch filter runner",
    long_about = "Apply a chain of filters to image files or .pcp projects.\n\n\
                  Example:\n  \
                  paintcore -i photo.png -f blur:5 -f grayscale -o out.png\n  \
                  paintcore -i \"*.jpg\" -f sepia --output-dir out/ --format png"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    /// .pcp projects keep their layers; other formats load as one layer.
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Filter to apply, in order. Repeatable: -f blur:5 -f grayscale.
    #[arg(short = 'f', long = "filter", value_name = "SPEC")]
    pub filters: Vec<String>,

    /// Canvas transform applied before selecting and filtering. Repeatable:
    /// flip_h | flip_v | rotate_cw | rotate_180 | rotate_ccw | rotate:deg |
    /// crop:x,y,w,h | canvas:w,h[,anchor] | scale:w,h[,interp]
    #[arg(short = 't', long = "transform", value_name = "SPEC")]
    pub transforms: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format extension (png, jpg, bmp, tiff, pcp, …).
    /// When omitted, inferred from --output, defaulting to png.
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Restrict filters to a region: rect:x,y,w,h | ellipse:cx,cy,rx,ry | poly:x0,y0,…
    #[arg(long, value_name = "SHAPE")]
    pub select: Option<String>,

    /// Settings file (key=value). Defaults to the platform settings path.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write a session log to this file.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Print per-file timing and info-level logs.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Everything parsed up front so a typo fails before any file is touched.
struct Plan {
    transforms: Vec<CanvasTransform>,
    filters: Vec<FilterSpec>,
    selection: Option<SelectionShape>,
    settings: EngineSettings,
    telemetry: SharedTelemetry,
    target: OutputTarget,
    jobs: FilterJobs,
}

/// How often a waiting commit wakes up to check the job is still pending.
const JOB_POLL: Duration = Duration::from_millis(250);

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let mut plan = match build_plan(&args) {
        Ok(plan) => plan,
        Err(e) => return report(&e),
    };

    let inputs = resolve_inputs(&args.input, &plan.telemetry);
    if inputs.is_empty() {
        return report(&not_found("no input files matched the given pattern(s)"));
    }
    if inputs.len() > 1 && matches!(plan.target, OutputTarget::File(_)) {
        return report(&EngineError::invalid_state(format!(
            "{} input files given but --output only accepts a single file path; use --output-dir",
            inputs.len()
        )));
    }
    if let OutputTarget::Dir { dir, .. } = &plan.target {
        if let Err(e) = std::fs::create_dir_all(dir) {
            return report(&EngineError::Io(e));
        }
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();
        let result = plan
            .target
            .path_for(input_path)
            .and_then(|output| run_one(input_path, &output, &mut plan).map(|()| output));
        match result {
            Ok(output) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                report(&e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

/// `error[<Kind>]: message` on stderr.
fn report(e: &EngineError) -> ExitCode {
    eprintln!("error[{}]: {}", e.kind(), e);
    ExitCode::FAILURE
}

fn not_found(msg: &str) -> EngineError {
    EngineError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, msg.to_string()))
}

fn build_plan(args: &CliArgs) -> Result<Plan> {
    let transforms = args
        .transforms
        .iter()
        .map(|s| s.parse::<CanvasTransform>())
        .collect::<Result<Vec<_>>>()?;
    let filters = args
        .filters
        .iter()
        .map(|s| s.parse::<FilterSpec>())
        .collect::<Result<Vec<_>>>()?;
    let selection = args.select.as_deref().map(str::parse::<SelectionShape>).transpose()?;
    let settings = match &args.config {
        Some(path) => {
            if !path.exists() {
                return Err(not_found(&format!("config file '{}' not found", path.display())));
            }
            EngineSettings::load_from(path)
        }
        None => EngineSettings::load(),
    };
    let telemetry: SharedTelemetry = match &args.log_file {
        Some(path) => Arc::new(SessionLog::open(path)?),
        None => Arc::new(LogTelemetry),
    };
    let mut jobs = FilterJobs::from_settings(&settings)?;
    jobs.set_telemetry(Arc::clone(&telemetry));
    let target = OutputTarget::from_args(args);
    Ok(Plan {
        transforms,
        filters,
        selection,
        settings,
        telemetry,
        target,
        jobs,
    })
}

fn run_one(input: &Path, output: &Path, plan: &mut Plan) -> Result<()> {
    let codec = ImageCodec::default();

    // -- Step 1: Load ----------------------------------------------------
    let mut project = if io::is_project_path(input) {
        Project::open(input, &plan.settings)?
    } else {
        Project::open_image(input, &codec, &plan.settings)?
    };
    project.set_telemetry(Arc::clone(&plan.telemetry));

    // -- Step 2: Reshape the canvas ---------------------------------------
    for transform in &plan.transforms {
        project.transform_canvas(transform)?;
    }

    // -- Step 3: Select + filter -----------------------------------------
    if let Some(shape) = &plan.selection {
        project.select(shape, SelectionMode::Replace, true)?;
    }
    for spec in &plan.filters {
        commit_on_pool(&mut project, &mut plan.jobs, spec)?;
    }

    // -- Step 4: Save ----------------------------------------------------
    if io::is_project_path(output) {
        project.save(output)
    } else {
        project.export(output, &codec)
    }
}

/// Compute `spec` on the worker pool and publish the result.  Returns
/// whether anything changed.
fn commit_on_pool(project: &mut Project, jobs: &mut FilterJobs, spec: &FilterSpec) -> Result<bool> {
    let target = project.filter_target()?;
    jobs.spawn_commit(
        project.pipeline(),
        target.layer,
        target.pixels,
        target.revision,
        spec.clone(),
        target.region,
    );
    loop {
        match jobs.wait(JOB_POLL) {
            Some(JobOutcome::Commit { command }) => return project.publish(command),
            Some(JobOutcome::Failed { error, .. }) => return Err(error),
            Some(JobOutcome::Preview { .. }) => {}
            None if jobs.pending() == 0 => {
                return Err(EngineError::invalid_state(format!("{} finished without a result", spec)));
            }
            None => {}
        }
    }
}

/// Literal paths and glob matches in argument order, each file once.
/// Patterns that match nothing are reported through `telemetry`.
fn resolve_inputs(patterns: &[String], telemetry: &SharedTelemetry) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for pattern in patterns {
        let matches = match expand_pattern(pattern, telemetry) {
            Ok(m) => m,
            Err(e) => {
                log_warn!(telemetry, "skipping input '{}': {}", pattern, e);
                continue;
            }
        };
        if matches.is_empty() {
            log_warn!(telemetry, "pattern '{}' matched no files", pattern);
        }
        files.extend(matches.into_iter().filter(|p| seen.insert(p.clone())));
    }
    files
}

fn expand_pattern(pattern: &str, telemetry: &SharedTelemetry) -> Result<Vec<PathBuf>> {
    let literal = Path::new(pattern);
    if literal.exists() {
        return Ok(vec![literal.to_path_buf()]);
    }
    let paths = glob::glob(pattern).map_err(|e| EngineError::out_of_range(format!("bad glob: {}", e)))?;
    let mut found = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => found.push(path),
            Err(e) => log_warn!(telemetry, "cannot read '{}': {}", e.path().display(), e.error()),
        }
    }
    Ok(found)
}

/// Where results go, decided once from `--output`, `--output-dir` and
/// `--format`.
#[derive(Clone, Debug, PartialEq, Eq)]
enum OutputTarget {
    /// Single explicit file.
    File(PathBuf),
    /// `<dir>/<stem>.<ext>` per input.
    Dir { dir: PathBuf, ext: String },
    /// Next to the input with the new extension; `_out` is added to the stem
    /// when that would overwrite the input.
    BesideInput { ext: String },
}

impl OutputTarget {
    fn from_args(args: &CliArgs) -> Self {
        let ext = output_extension(args.format.as_deref(), args.output.as_deref());
        match (&args.output_dir, &args.output) {
            (Some(dir), _) => OutputTarget::Dir { dir: dir.clone(), ext },
            (None, Some(file)) => OutputTarget::File(file.clone()),
            (None, None) => OutputTarget::BesideInput { ext },
        }
    }

    fn path_for(&self, input: &Path) -> Result<PathBuf> {
        let stem = || {
            input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| EngineError::invalid_state(format!("'{}' has no file name", input.display())))
        };
        match self {
            OutputTarget::File(file) => Ok(file.clone()),
            OutputTarget::Dir { dir, ext } => Ok(dir.join(format!("{}.{}", stem()?, ext))),
            OutputTarget::BesideInput { ext } => {
                let renamed = input.with_extension(ext);
                if renamed == input {
                    Ok(input.with_file_name(format!("{}_out.{}", stem()?, ext)))
                } else {
                    Ok(renamed)
                }
            }
        }
    }
}

/// Extension from `--format`, else from `--output`, else png.
fn output_extension(format_arg: Option<&str>, output: Option<&Path>) -> String {
    if let Some(f) = format_arg {
        return f.trim_start_matches('.').to_lowercase();
    }
    output
        .and_then(|o| o.extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| "png".to_string())
}
