use std::{env, path::PathBuf, str::FromStr};

use anyhow::{Context, Result, bail};
use backend::BackendKind;
use model::synth::{SynthConfig, random_model};

mod bench;
mod crosscheck;

const DEFAULT_BOARD_LEN: usize = 19;

const USAGE: &str = "usage:
    nnbench synth <out.safetensors> [seed]
    nnbench bench <model> [reference|gemm] [batch] [iters]
    nnbench crosscheck <model>";

/// Settings taken from the environment.
pub struct Env {
    pub width: usize,
    pub height: usize,
    pub tuner_file: Option<PathBuf>,
}

impl Env {
    fn read() -> Result<Self> {
        Ok(Self {
            width: var_or("NN_X_LEN", DEFAULT_BOARD_LEN)?,
            height: var_or("NN_Y_LEN", DEFAULT_BOARD_LEN)?,
            tuner_file: env::var_os("NN_TUNER_FILE").map(PathBuf::from),
        })
    }
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("invalid {key} {value:?}")),
        Err(_) => Ok(default),
    }
}

fn arg_or<T>(args: &[String], i: usize, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match args.get(i) {
        Some(arg) => arg.parse().with_context(|| format!("invalid {name} {arg:?}")),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    match command.as_str() {
        "synth" => {
            let Some(out) = args.get(1) else {
                bail!(USAGE);
            };
            let seed = arg_or(&args, 2, "seed", 0)?;

            let desc = random_model(&SynthConfig::default(), seed);
            model::save_model_file(out, &desc)?;
            println!("wrote synthetic model {} to {out}", desc.name);
        }
        "bench" => {
            let Some(path) = args.get(1) else {
                bail!(USAGE);
            };
            let backend = match args.get(2) {
                Some(name) => BackendKind::from_name(name)
                    .with_context(|| format!("unknown backend {name:?}"))?,
                None => BackendKind::default(),
            };

            let opts = bench::Opts {
                backend,
                batch_size: arg_or(&args, 3, "batch", 16)?,
                iters: arg_or(&args, 4, "iters", 20)?,
            };
            bench::run(path, &opts, &Env::read()?)?;
        }
        "crosscheck" => {
            let Some(path) = args.get(1) else {
                bail!(USAGE);
            };
            crosscheck::run(path, &Env::read()?)?;
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }

    Ok(())
}
