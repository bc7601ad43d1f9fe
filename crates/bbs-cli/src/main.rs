use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use bbs_solver::{
    Bar1D, BlockBuilderAndSolver, DISPLACEMENT_X, DofKey, Model, NodeOwnership, PointLoad,
    ResidualBasedStaticScheme, SolverParameters, ThreadCommunicator, create_solver,
};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

const YOUNGS_MODULUS: f64 = 210000.0;
const AREA: f64 = 0.001;
const ELEMENT_LENGTH: f64 = 1.0;
const DEFAULT_LOAD: f64 = 1000.0;

fn usage() {
    eprintln!("usage: bbs-cli bar <elements> [--partitions N] [--settings params.json] [--load F]");
}

#[derive(Debug, Clone, PartialEq)]
struct BarArgs {
    elements: u64,
    partitions: usize,
    settings: Option<PathBuf>,
    load: f64,
}

fn parse_args(args: &[String]) -> Result<BarArgs, String> {
    let Some((command, rest)) = args.split_first() else {
        return Err("missing command".to_string());
    };
    if command != "bar" {
        return Err(format!("unknown command: {command}"));
    }
    let Some((elements, mut rest)) = rest.split_first() else {
        return Err("missing element count".to_string());
    };
    let elements: u64 = elements
        .parse()
        .map_err(|_| format!("invalid element count: {elements}"))?;

    let mut parsed = BarArgs {
        elements,
        partitions: 1,
        settings: None,
        load: DEFAULT_LOAD,
    };
    while let Some((flag, tail)) = rest.split_first() {
        let Some((value, tail)) = tail.split_first() else {
            return Err(format!("{flag} expects a value"));
        };
        match flag.as_str() {
            "--partitions" => {
                parsed.partitions = value
                    .parse()
                    .map_err(|_| format!("invalid partition count: {value}"))?;
            }
            "--settings" => parsed.settings = Some(PathBuf::from(value)),
            "--load" => {
                parsed.load = value.parse().map_err(|_| format!("invalid load: {value}"))?;
            }
            other => return Err(format!("unknown option: {other}")),
        }
        rest = tail;
    }

    if parsed.elements == 0 {
        return Err("the bar needs at least one element".to_string());
    }
    if parsed.partitions == 0 || parsed.partitions as u64 > parsed.elements {
        return Err(format!(
            "partitions must be between 1 and {}, got {}",
            parsed.elements, parsed.partitions
        ));
    }
    Ok(parsed)
}

fn load_parameters(path: Option<&Path>) -> Result<SolverParameters, String> {
    let Some(path) = path else {
        return Ok(SolverParameters::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
    SolverParameters::from_json(&text).map_err(|err| format!("{}: {err}", path.display()))
}

fn node_owner(node: u64, elements: u64, partitions: usize) -> usize {
    let element = node.min(elements) - 1;
    (element as usize * partitions) / elements as usize
}

/// Share of a fixed-free bar held by `rank`. Bars go to the owner of their
/// first node, the tip load to the owner of the last node.
fn bar_model(rank: usize, partitions: usize, elements: u64, load: f64) -> Model {
    let mut ownership = NodeOwnership::new(0);
    for node in 1..=elements + 1 {
        ownership.assign(node, node_owner(node, elements, partitions));
    }
    let mut model = Model::new(ownership);
    for e in 1..=elements {
        if node_owner(e, elements, partitions) == rank {
            let x = (e - 1) as f64 * ELEMENT_LENGTH;
            model.add_element(Arc::new(Bar1D::new(
                e,
                [e, e + 1],
                [x, x + ELEMENT_LENGTH],
                YOUNGS_MODULUS,
                AREA,
            )));
        }
    }
    let tip = elements + 1;
    if node_owner(tip, elements, partitions) == rank {
        model.add_condition(Arc::new(PointLoad::new(elements + 1, tip, DISPLACEMENT_X, load)));
    }
    if node_owner(1, elements, partitions) == rank {
        model.fix(DofKey::new(1, DISPLACEMENT_X), 0.0);
    }
    model
}

struct PartitionReport {
    system_size: usize,
    solver: String,
    iterations: usize,
    residual_norm: Option<f64>,
    tip_displacement: Option<f64>,
    support_reaction: Option<f64>,
}

fn run_bar(args: &BarArgs, parameters: &SolverParameters) -> bbs_solver::Result<Value> {
    let mut settings = parameters.builder_and_solver_settings.clone();
    settings.calculate_reactions = true;
    let tip = DofKey::new(args.elements + 1, DISPLACEMENT_X);
    let support = DofKey::new(1, DISPLACEMENT_X);

    let reports = ThreadCommunicator::run(args.partitions, |comm| -> bbs_solver::Result<PartitionReport> {
        let rank = comm.rank();
        let scheme = ResidualBasedStaticScheme;
        let model = bar_model(rank, args.partitions, args.elements, args.load);
        let solver = create_solver(&parameters.linear_solver_settings);
        let mut builder = BlockBuilderAndSolver::new(settings.clone(), solver, Arc::clone(&comm))?;

        let mut system = builder.set_up(&scheme, &model)?;
        let info = builder.solve_linear_step(&scheme, &model, &mut system)?;

        let dofs = builder.dofs();
        Ok(PartitionReport {
            system_size: builder.equation_system_size(),
            solver: info.solver_name,
            iterations: info.iterations,
            residual_norm: info.residual_norm,
            tip_displacement: dofs
                .get(&tip)
                .filter(|dof| dof.owner() == rank)
                .map(|dof| dof.value()),
            support_reaction: dofs
                .get(&support)
                .filter(|dof| dof.owner() == rank)
                .map(|dof| dof.reaction()),
        })
    });
    let reports = reports.into_iter().collect::<bbs_solver::Result<Vec<_>>>()?;

    let first = &reports[0];
    let tip_displacement = reports.iter().find_map(|r| r.tip_displacement);
    let support_reaction = reports.iter().find_map(|r| r.support_reaction);
    let length = args.elements as f64 * ELEMENT_LENGTH;
    info!(
        target: "bbs_cli",
        system_size = first.system_size,
        solver = %first.solver,
        "bar solved"
    );

    Ok(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "model": {
            "elements": args.elements,
            "partitions": args.partitions,
            "load": args.load,
        },
        "system_size": first.system_size,
        "solver": first.solver,
        "iterations": first.iterations,
        "residual_norm": first.residual_norm,
        "tip_displacement": tip_displacement,
        "analytical_tip_displacement": args.load * length / (YOUNGS_MODULUS * AREA),
        "support_reaction": support_reaction,
    }))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bbs_solver=info,bbs_cli=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("{err}");
            usage();
            return ExitCode::from(2);
        }
    };
    init_tracing();

    let parameters = match load_parameters(parsed.settings.as_deref()) {
        Ok(parameters) => parameters,
        Err(err) => {
            eprintln!("settings error: {err}");
            return ExitCode::from(1);
        }
    };
    let report = match run_bar(&parsed, &parameters) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("solve error: {err}");
            return ExitCode::from(1);
        }
    };
    match serde_json::to_string_pretty(&report) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("report error: {err}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_bar_command() {
        let parsed = parse_args(&args(&["bar", "6", "--partitions", "3", "--load", "50"])).unwrap();
        assert_eq!(parsed.elements, 6);
        assert_eq!(parsed.partitions, 3);
        assert_eq!(parsed.load, 50.0);
        assert!(parsed.settings.is_none());
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["analyze", "deck.inp"])).is_err());
        assert!(parse_args(&args(&["bar"])).is_err());
        assert!(parse_args(&args(&["bar", "0"])).is_err());
        assert!(parse_args(&args(&["bar", "2", "--partitions", "3"])).is_err());
        assert!(parse_args(&args(&["bar", "2", "--load"])).is_err());
        assert!(parse_args(&args(&["bar", "2", "--mesh", "x"])).is_err());
    }

    #[test]
    fn reads_parameters_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "builder_and_solver_settings": {{ "echo_level": 1 }},
                "linear_solver_settings": {{ "solver_type": "conjugate_gradient", "tolerance": 1e-12 }}
            }}"#
        )
        .unwrap();
        let parameters = load_parameters(Some(file.path())).unwrap();
        assert_eq!(parameters.builder_and_solver_settings.echo_level, 1);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, r#"{{ "builder_and_solver_settings": {{ "name": "other" }} }}"#).unwrap();
        assert!(load_parameters(Some(broken.path())).is_err());
        assert!(load_parameters(Some(Path::new("/nonexistent/params.json"))).is_err());
    }

    #[test]
    fn partitioned_bar_matches_analytical_tip() {
        let parsed = parse_args(&args(&["bar", "4", "--partitions", "2"])).unwrap();
        let report = run_bar(&parsed, &SolverParameters::default()).unwrap();

        assert_eq!(report["system_size"], 4);
        assert_eq!(report["model"]["partitions"], 2);
        let tip = report["tip_displacement"].as_f64().unwrap();
        let expected = report["analytical_tip_displacement"].as_f64().unwrap();
        assert!((tip - expected).abs() < 1e-9 * expected.abs());
        let reaction = report["support_reaction"].as_f64().unwrap();
        assert!((reaction + DEFAULT_LOAD).abs() < 1e-6);
        assert!(report["timestamp"].as_str().is_some());
    }
}
