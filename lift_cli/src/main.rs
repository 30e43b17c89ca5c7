use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use lift_core::query::{ProgressRequest, SeriesRequest, SeriesTarget, SetQueryRequest};
use lift_core::series::SeriesStore;
use lift_core::week::week_start_of;
use lift_core::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lift")]
#[command(about = "Training-load rollups for strength workouts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Exercise catalog (TOML) to use instead of the configured one
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log more to stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Fold a completed workout (JSON file) into facts and weekly series
    Apply {
        /// Workout JSON file
        workout: PathBuf,
    },

    /// Remove a deleted workout's facts and invert its series contribution
    Retract {
        /// Workout JSON file (its workout_id is used)
        workout: Option<PathBuf>,

        /// Workout id, instead of a file
        #[arg(long, conflicts_with = "workout")]
        workout_id: Option<String>,
    },

    /// Query raw set facts for exactly one target
    Sets(SetsArgs),

    /// Weekly series for one target
    Series {
        #[command(flatten)]
        target: TargetArgs,

        /// Number of weeks ending at --as-of
        #[arg(long)]
        weeks: Option<u32>,

        /// Last day of the window (defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Weekly series with plateau/deload/overreach flags and top exercises
    Progress {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        weeks: Option<u32>,

        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Include the rep-range distribution
        #[arg(long)]
        distribution: bool,
    },

    /// Rebuild one weekly bucket from raw set facts
    Reconcile {
        /// exercise, muscle_group or muscle
        #[arg(long)]
        kind: String,

        #[arg(long)]
        id: String,

        /// Any day of the week to rebuild
        #[arg(long)]
        week: NaiveDate,
    },

    /// Delete a target's whole weekly series
    Purge {
        #[arg(long)]
        kind: String,

        #[arg(long)]
        id: String,
    },

    /// Append a target's weekly series to a CSV file
    Export {
        #[arg(long)]
        kind: String,

        #[arg(long)]
        id: String,

        /// Output CSV (defaults to <data-dir>/exports/<kind>__<id>.csv)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SetsArgs {
    /// Exercise id (repeatable)
    #[arg(long = "exercise-id")]
    exercise_ids: Vec<String>,

    #[arg(long)]
    muscle_group: Option<String>,

    #[arg(long)]
    muscle: Option<String>,

    /// First day (inclusive, UTC)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last day (inclusive, UTC)
    #[arg(long)]
    to: Option<NaiveDate>,

    #[arg(long)]
    include_warmups: bool,

    #[arg(long)]
    equipment: Option<String>,

    #[arg(long)]
    movement_pattern: Option<String>,

    #[arg(long)]
    min_hard_set_credit: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    max_rir: Option<i32>,

    #[arg(long)]
    failure_only: bool,

    /// date_asc, date_desc, e1rm_desc or volume_desc
    #[arg(long)]
    sort: Option<String>,

    #[arg(long)]
    limit: Option<usize>,

    /// Cursor from a previous page
    #[arg(long)]
    cursor: Option<String>,

    /// Field to include (repeatable)
    #[arg(long = "field")]
    fields: Vec<String>,
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    exercise_id: Option<String>,

    #[arg(long)]
    exercise_name: Option<String>,

    #[arg(long)]
    muscle_group: Option<String>,

    #[arg(long)]
    muscle: Option<String>,
}

impl TargetArgs {
    fn into_target(self) -> Result<SeriesTarget> {
        let mut targets: Vec<SeriesTarget> = [
            self.exercise_id.map(SeriesTarget::ExerciseId),
            self.exercise_name.map(SeriesTarget::ExerciseName),
            self.muscle_group.map(SeriesTarget::MuscleGroup),
            self.muscle.map(SeriesTarget::Muscle),
        ]
        .into_iter()
        .flatten()
        .collect();
        match targets.len() {
            1 => Ok(targets.remove(0)),
            n => Err(Error::InvalidArgument(format!(
                "exactly one of --exercise-id, --exercise-name, --muscle-group or --muscle is required ({} given)",
                n
            ))),
        }
    }
}

/// Everything a command needs, opened once
struct Context {
    data_dir: PathBuf,
    config: Config,
    store: Arc<dyn DocumentStore>,
    catalog: Arc<dyn AttributionProvider>,
}

impl Context {
    fn open(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(|| config.data.data_dir.clone());

        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::open(
            data_dir.join("store"),
            config.store.max_batch_ops,
        )?);

        let catalog_path = cli
            .catalog
            .clone()
            .unwrap_or_else(|| config.catalog_path(&data_dir));
        let catalog: Arc<dyn AttributionProvider> =
            Arc::new(StaticCatalog::load_or_default(&catalog_path)?);
        tracing::debug!("Using data directory {:?}", data_dir);

        Ok(Self {
            data_dir,
            config,
            store,
            catalog,
        })
    }

    fn rollup(&self) -> RollupEngine {
        RollupEngine::new(self.store.clone(), self.catalog.clone())
    }

    fn query(&self) -> QueryCapsEngine {
        // Reads resolve names through the lookup cache; writes never do
        let cached: Arc<dyn AttributionProvider> = Arc::new(CachedCatalog::new(
            self.catalog.clone(),
            self.store.clone(),
            &self.config.cache,
        ));
        QueryCapsEngine::new(self.store.clone(), cached, self.config.caps.clone())
    }

    /// Resolve `--kind`/`--id` the same way the read commands resolve targets
    fn series_key(&self, kind: &str, id: String) -> Result<SeriesKey> {
        let target = match TargetKind::parse(kind)? {
            TargetKind::Exercise => SeriesTarget::ExerciseId(id),
            TargetKind::MuscleGroup => SeriesTarget::MuscleGroup(id),
            TargetKind::Muscle => SeriesTarget::Muscle(id),
        };
        self.query().resolve_series_target(&target)
    }
}

fn main() {
    let cli = Cli::parse();
    lift_core::logging::init(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        let code = match e.kind() {
            ErrorKind::InvalidArgument => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::Internal => 1,
        };
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let ctx = Context::open(&cli)?;

    match cli.command {
        Commands::Apply { workout } => cmd_apply(&ctx, &workout),
        Commands::Retract {
            workout,
            workout_id,
        } => cmd_retract(&ctx, workout.as_deref(), workout_id),
        Commands::Sets(args) => cmd_sets(&ctx, args),
        Commands::Series {
            target,
            weeks,
            as_of,
        } => {
            let req = SeriesRequest {
                target: target.into_target()?,
                window_weeks: weeks,
                as_of,
            };
            print_json(&ctx.query().get_series(&req)?)
        }
        Commands::Progress {
            target,
            weeks,
            as_of,
            distribution,
        } => {
            let req = ProgressRequest {
                target: target.into_target()?,
                window_weeks: weeks,
                include_distribution: distribution,
                as_of,
            };
            print_json(&ctx.query().progress_summary(&req)?)
        }
        Commands::Reconcile { kind, id, week } => {
            let key = ctx.series_key(&kind, id)?;
            print_json(&ctx.rollup().reconcile(&key, week_start_of(week))?)
        }
        Commands::Purge { kind, id } => {
            let key = ctx.series_key(&kind, id)?;
            let purged = ctx.rollup().purge(&key)?;
            print_json(&serde_json::json!({ "target": key, "purged": purged }))
        }
        Commands::Export { kind, id, output } => cmd_export(&ctx, &kind, id, output),
    }
}

fn read_workout(path: &Path) -> Result<WorkoutInput> {
    let contents = std::fs::read_to_string(path)?;
    WorkoutInput::from_json(&contents)
}

fn cmd_apply(ctx: &Context, path: &Path) -> Result<()> {
    let workout = read_workout(path)?;
    let report = ctx.rollup().apply_workout(&workout)?;
    print_json(&report)
}

fn cmd_retract(ctx: &Context, path: Option<&Path>, workout_id: Option<String>) -> Result<()> {
    let workout_id = match (path, workout_id) {
        (_, Some(id)) => id,
        (Some(path), None) => read_workout(path)?.workout_id,
        (None, None) => {
            return Err(Error::InvalidArgument(
                "retract needs a workout file or --workout-id".into(),
            ))
        }
    };
    let report = ctx.rollup().retract_workout(&workout_id)?;
    print_json(&report)
}

fn cmd_sets(ctx: &Context, args: SetsArgs) -> Result<()> {
    let req = SetQueryRequest {
        exercise_ids: args.exercise_ids,
        muscle_group: args.muscle_group,
        muscle: args.muscle,
        from: args.from,
        to: args.to,
        include_warmups: args.include_warmups,
        equipment: args.equipment,
        movement_pattern: args.movement_pattern,
        min_hard_set_credit: args.min_hard_set_credit,
        max_rir: args.max_rir,
        failure_only: args.failure_only,
        sort: args.sort,
        limit: args.limit,
        cursor: args.cursor,
        fields: args.fields,
    };
    print_json(&ctx.query().query_sets(&req)?)
}

fn cmd_export(ctx: &Context, kind: &str, id: String, output: Option<PathBuf>) -> Result<()> {
    let key = ctx.series_key(kind, id)?;
    let series = SeriesStore::new(ctx.store.as_ref())
        .load(&key)?
        .ok_or_else(|| Error::NotFound(format!("no weekly series for {}", key)))?;

    let output = output.unwrap_or_else(|| {
        ctx.data_dir
            .join("exports")
            .join(format!("{}__{}.csv", key.kind, file_safe(&key.id)))
    });
    let rows = export_series_csv(&series, &output)?;
    print_json(&serde_json::json!({
        "target": key,
        "rows": rows,
        "path": output.display().to_string(),
    }))
}

/// Keep an id from naming a path outside the exports directory
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let value: Value = serde_json::to_value(value)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
