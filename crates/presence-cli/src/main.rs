use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use presence_core::{
    normalize_face, train_and_save, DetectParams, FaceDetect, Recognition, Recognizer,
    ScrfdDetector, TrainError,
};
use presence_hw::{Camera, FrameSource};
use presence_store::{AttendanceLedger, EnrollError, IdentityStore, Storage};
use presenced::Config;
use serde::Serialize;
use std::path::PathBuf;

mod render;

#[derive(Parser)]
#[command(name = "presence", version, about = "Presence face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a user from a face image
    Enroll {
        /// User id (defaults to a random UUID)
        #[arg(long)]
        id: Option<String>,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Image containing the user's face
        image: PathBuf,
    },
    /// Change an enrolled user's display name
    Rename { id: String, name: String },
    /// Train the recognition model from every enrolled user
    Train,
    /// List enrolled users
    Users {
        #[arg(long)]
        json: bool,
    },
    /// Show attendance records (all records if no filter is given)
    Attendance {
        /// Records of one day (YYYY-MM-DD)
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<NaiveDate>,
        /// Range start, inclusive
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        /// Range end, inclusive
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        /// Only this user's records
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Attendance statistics
    Stats {
        #[command(subcommand)]
        scope: StatsScope,
    },
    /// Per-day attendance totals, newest first
    Summary {
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Cameras {
        /// Grab one frame from each device and report its brightness
        #[arg(long)]
        grab: bool,
    },
    /// Detect and recognize faces in an image without recording attendance
    Recognize {
        image: PathBuf,
        /// Override the configured match threshold
        #[arg(long)]
        threshold: Option<f64>,
    },
}

#[derive(Subcommand)]
enum StatsScope {
    /// Days attended and first/last sighting of one user
    User {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Totals for one day (defaults to today)
    Day {
        date: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    tracing::debug!(
        db = %config.db_path.display(),
        model = %config.model_path.display(),
        threshold = config.threshold,
        "configuration loaded"
    );

    match cli.command {
        Commands::Enroll { id, name, image } => {
            let identities = open_identities(&config)?;
            let picture = image::open(&image)
                .with_context(|| format!("failed to read {}", image.display()))?
                .to_luma8();
            let mut detector = load_detector(&config)?;
            let user_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            match identities.enroll(&user_id, &name, &picture, &mut detector) {
                Ok(user) => {
                    println!("Enrolled {} ({})", user.name, user.user_id);
                    println!("Run `presence train` to include this user in recognition.");
                }
                Err(EnrollError::NoFaceDetected) => {
                    bail!("no face found in {}; try a clearer, front-facing photo", image.display())
                }
                Err(e) => return Err(e).context("enrollment failed"),
            }
        }
        Commands::Rename { id, name } => {
            let identities = open_identities(&config)?;
            if !identities.rename(&id, &name)? {
                bail!("no enrolled user {id:?} (or the new name is empty)");
            }
            println!("Renamed {id} to {}", name.trim());
        }
        Commands::Train => {
            let identities = open_identities(&config)?;
            let mut detector = load_detector(&config)?;
            match train_and_save(&identities, &mut detector, &config.model_path) {
                Ok(report) => {
                    println!(
                        "Trained {} user(s) into {}",
                        report.trained,
                        config.model_path.display()
                    );
                    if !report.skipped.is_empty() {
                        println!("Skipped (no usable face): {}", report.skipped.join(", "));
                    }
                    println!("Send SIGHUP to presenced to load the new model.");
                }
                Err(TrainError::NoTrainableFaces) => {
                    bail!("no enrolled user has a usable face image; enroll users first")
                }
                Err(e) => return Err(e).context("training failed"),
            }
        }
        Commands::Users { json } => {
            let users = open_identities(&config)?.list_all()?;
            if json {
                print_json(&users)?;
            } else {
                print!("{}", render::users_table(&users));
            }
        }
        Commands::Attendance {
            date,
            from,
            to,
            user,
            json,
        } => {
            let ledger = open_ledger(&config)?;
            let mut records = match (date, from.zip(to), &user) {
                (Some(day), _, _) => ledger.on_date(day)?,
                (None, Some((from, to)), _) => ledger.in_range(from, to)?,
                (None, None, Some(user_id)) => ledger.for_user(user_id)?,
                (None, None, None) => ledger.all()?,
            };
            if let Some(user_id) = &user {
                records.retain(|r| &r.user_id == user_id);
            }
            if json {
                print_json(&records)?;
            } else {
                print!("{}", render::records_table(&records));
            }
        }
        Commands::Stats { scope } => {
            let ledger = open_ledger(&config)?;
            match scope {
                StatsScope::User { id, json } => {
                    let stats = ledger.user_stats(&id)?;
                    if json {
                        print_json(&stats)?;
                    } else {
                        print!("{}", render::user_stats(&stats));
                    }
                }
                StatsScope::Day { date, json } => {
                    let day = date.unwrap_or_else(|| Local::now().date_naive());
                    let stats = ledger.daily_stats(day)?;
                    if json {
                        print_json(&stats)?;
                    } else {
                        print!("{}", render::daily_stats(&stats));
                    }
                }
            }
        }
        Commands::Summary { from, to, json } => {
            let summary = open_ledger(&config)?.summary(from.zip(to))?;
            if json {
                print_json(&summary)?;
            } else {
                print!("{}", render::summary_table(&summary));
            }
        }
        Commands::Cameras { grab } => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}  {} [{}] {}", device.path, device.name, device.driver, device.bus);
                if grab {
                    match grab_frame(&device.path, &config) {
                        Ok(line) => println!("    {line}"),
                        Err(e) => println!("    capture failed: {e}"),
                    }
                }
            }
        }
        Commands::Recognize { image, threshold } => {
            let picture = image::open(&image)
                .with_context(|| format!("failed to read {}", image.display()))?
                .to_luma8();
            let threshold = threshold.unwrap_or(config.threshold);
            let recognizer = Recognizer::load(&config.model_path, threshold)
                .context("no usable recognition model; run `presence train` first")?;
            let mut detector = load_detector(&config)?;

            let regions = detector.detect(&picture, &DetectParams::STRICT)?;
            if regions.is_empty() {
                println!("No face detected");
            }
            for (i, region) in regions.iter().enumerate() {
                let face = normalize_face(&picture, region)?;
                match recognizer.recognize(&face) {
                    Recognition::Known {
                        user_id,
                        confidence,
                    } => println!(
                        "face {i} at ({:.0}, {:.0}) {:.0}x{:.0}: {user_id} (distance {confidence:.2})",
                        region.x, region.y, region.width, region.height
                    ),
                    Recognition::Unknown => println!(
                        "face {i} at ({:.0}, {:.0}) {:.0}x{:.0}: unknown",
                        region.x, region.y, region.width, region.height
                    ),
                }
            }
        }
    }

    Ok(())
}

fn open_storage(config: &Config) -> Result<Storage> {
    Storage::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))
}

fn open_identities(config: &Config) -> Result<IdentityStore> {
    Ok(IdentityStore::new(open_storage(config)?, &config.image_dir))
}

fn open_ledger(config: &Config) -> Result<AttendanceLedger> {
    Ok(AttendanceLedger::new(open_storage(config)?))
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    ScrfdDetector::load(&config.detector_model).with_context(|| {
        format!(
            "failed to load face detector from {}",
            config.detector_model.display()
        )
    })
}

fn grab_frame(path: &str, config: &Config) -> Result<String> {
    let mut camera = Camera::open(path, config.frame_timeout)?;
    let Some(frame) = camera.read_frame()? else {
        bail!("camera returned no frame");
    };
    Ok(format!(
        "{}x{} {:?}, brightness {:.1}{}",
        frame.width(),
        frame.height(),
        camera.fourcc,
        frame.avg_brightness(),
        if frame.is_dark { " (dark)" } else { "" }
    ))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
