//! CLI demo for the tensor compute core.
//!
//! Runs the reference scenarios on the host and on the simulated
//! accelerator, and validates a gradient against finite differences.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tc_backend_device::{Runtime, RuntimeConfig};
use tc_tensor::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Placement {
    Host,
    Device,
    Both,
}

/// Tensor compute demo.
#[derive(Parser, Debug)]
#[command(name = "tc", about = "Tensor autograd on host and simulated accelerator", version)]
struct Cli {
    /// Where to run the scenarios.
    #[arg(short, long, value_enum, default_value_t = Placement::Both)]
    placement: Placement,

    /// Memory per simulated device, in MiB. Defaults to `TC_DEVICE_MEMORY_MB`.
    #[arg(long)]
    device_memory_mb: Option<usize>,

    /// Step for the finite-difference check.
    #[arg(long, default_value_t = 1e-2)]
    eps: f32,

    /// Largest accepted |autograd - finite difference|.
    #[arg(long, default_value_t = 1e-2)]
    tolerance: f32,
}

/// Moves host tensors to wherever the scenario runs.
struct Target {
    runtime: Option<Arc<Runtime>>,
}

impl Target {
    fn name(&self) -> String {
        match &self.runtime {
            None => "host".to_string(),
            Some(rt) => rt.default_device().map(|d| d.name().to_string()).unwrap_or_default(),
        }
    }

    fn place(&self, t: Tensor) -> Result<Tensor> {
        match &self.runtime {
            None => Ok(t),
            Some(rt) => t.to(rt, rt.default_device()?),
        }
    }

    fn tensor(&self, data: Vec<f32>, shape: &[usize]) -> Result<Tensor> {
        self.place(Tensor::from_vec(data, shape)?)
    }
}

fn show(label: &str, t: &Tensor) -> Result<()> {
    println!("   {label} {} = {:?}", t.shape(), t.to_vec()?);
    Ok(())
}

fn scenarios(target: &Target) -> Result<()> {
    println!("=== Scenarios on {} ===\n", target.name());

    println!("1. ones(2, 3) @ ones(3, 2)");
    let c = target.place(Tensor::ones([2, 3]))?.matmul(&target.place(Tensor::ones([3, 2]))?)?;
    show("C", &c)?;

    println!("2. transpose([[1, 2], [3, 4]])");
    let m = target.tensor(vec![1.0, 2.0, 3.0, 4.0], &[2, 2])?;
    show("T", &m.transpose()?)?;

    println!("3. sum([[1, 2], [3, 4]], dim 0)");
    show("S", &m.sum(0, false)?)?;

    println!("4. conv2d(arange(9) as [1, 3, 3], ones [1, 1, 2, 2])");
    let x = target.tensor((0..9).map(|v| v as f32).collect(), &[1, 3, 3])?;
    show("Y", &x.conv2d(&target.place(Tensor::ones([1, 1, 2, 2]))?)?)?;
    println!();
    Ok(())
}

/// `sum(sigmoid(x @ w + b))` with gradients for all three operands.
fn gradient_check(target: &Target, eps: f32, tolerance: f32) -> Result<bool> {
    let x = target.tensor(vec![0.5, -1.0, 1.5, 2.0, 0.0, -0.5], &[2, 3])?;
    let w = target.tensor(vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6], &[3, 2])?.track_grad();
    let b = target.tensor(vec![0.05, -0.05], &[2])?.track_grad();

    let forward = |w: &Tensor, b: &Tensor| -> Result<f32> {
        let y = x.matmul(w)?.add(b)?.activate(Activation::Sigmoid)?.sum_all()?;
        Ok(y.to_vec()?[0])
    };

    let loss = x
        .matmul_with_grad(&w)?
        .add_with_grad(&b)?
        .activate_with_grad(Activation::Sigmoid)?
        .sum_all_with_grad()?;
    loss.backward()?;
    println!("=== Gradient check on {} ===\n", target.name());
    println!("   loss = {:.6}", loss.to_vec()?[0]);

    let mut max_err = 0.0f32;
    for (name, param, is_w) in [("w", &w, true), ("b", &b, false)] {
        let analytic = param.grad().map(|g| g.to_vec()).transpose()?.unwrap_or_default();
        let host = param.to_host()?;
        for (i, &a) in analytic.iter().enumerate() {
            let nudge = |delta: f32| -> Result<f32> {
                let mut data = host.to_vec()?;
                data[i] += delta;
                let p = target.tensor(data, host.dims())?;
                if is_w {
                    forward(&p, &b)
                } else {
                    forward(&w, &p)
                }
            };
            let numeric = (nudge(eps)? - nudge(-eps)?) / (2.0 * eps);
            max_err = max_err.max((a - numeric).abs());
            println!("   d{name}[{i}]: autograd = {a:.6}, finite difference = {numeric:.6}");
        }
    }

    let pass = max_err < tolerance;
    println!(
        "\n{}: max error {max_err:.2e} {} tolerance {tolerance:.2e}\n",
        if pass { "PASS" } else { "FAIL" },
        if pass { "<" } else { ">=" }
    );
    Ok(pass)
}

fn run(cli: &Cli) -> Result<bool> {
    let mut targets = Vec::new();
    if cli.placement != Placement::Device {
        targets.push(Target { runtime: None });
    }
    if cli.placement != Placement::Host {
        let mut config = RuntimeConfig::default();
        if let Some(mb) = cli.device_memory_mb {
            config = config.with_memory_bytes(mb << 20);
        }
        let runtime = Runtime::new(config);
        tc_tensor::install(&runtime, runtime.default_device()?)?;
        targets.push(Target { runtime: Some(runtime) });
    }

    let mut pass = true;
    for target in &targets {
        scenarios(target)?;
        pass &= gradient_check(target, cli.eps, cli.tolerance)?;
    }
    Ok(pass)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::info!(placement = ?cli.placement, "tc v{}", env!("CARGO_PKG_VERSION"));

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(%err, "scenario failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
