//! # Kinetics Simulation Benchmark
//!
//! Integrates two kinetics models with the BDF driver, once with a hand-written rates closure
//! and once with the natively compiled rates function, to show what the compiled code costs
//! inside a real solve.
//!
//! - **Michaelis-Menten chain**: 7 substrates converted in sequence by enzymes with product
//!   inhibition, `v_i = vmax_i * S_i / (km_i + S_i) - kie_i * S_{i+1}`, integrated over
//!   `[0, 150]`
//! - **Robertson**: the classic stiff three-species system, integrated over `[0, 40]`
//!
//! Run with: `cargo bench --bench simulation`

use std::hint::black_box;
use std::sync::Arc;

use cellsim::prelude::*;
use criterion::{criterion_group, criterion_main, Criterion};

const ENZYMES: usize = 7;

struct Problem {
    constants: Vec<f64>,
    states: Vec<f64>,
    voi_end: f64,
}

fn run_simulation(problem: &Problem, compute_rates: ComputeRatesFn) -> f64 {
    let mut solver = BdfSolver::new(SolverConfiguration {
        maximum_number_of_steps: 100_000,
        relative_tolerance: 1e-8,
        absolute_tolerance: 1e-10,
        ..Default::default()
    });
    let mut states = problem.states.clone();
    let mut rates = vec![0.0; states.len()];
    let mut algebraic: Vec<f64> = Vec::new();

    solver
        .initialize(
            0.0,
            problem.voi_end,
            SolverData {
                constants: &problem.constants,
                rates: &mut rates,
                states: &mut states,
                algebraic: &mut algebraic,
            },
            compute_rates,
        )
        .expect("valid problem");
    let mut voi = 0.0;
    solver
        .solve(
            &mut voi,
            problem.voi_end,
            SolverData {
                constants: &problem.constants,
                rates: &mut rates,
                states: &mut states,
                algebraic: &mut algebraic,
            },
        )
        .expect("problem integrates");
    voi
}

fn michaelis_menten() -> (Problem, String, VariableMap) {
    let mut constants = Vec::new();
    let mut constant_names = Vec::new();
    for i in 0..ENZYMES {
        constants.extend([0.85, 150.0, 0.01]);
        constant_names.extend([format!("vmax_{i}"), format!("km_{i}"), format!("kie_{i}")]);
    }
    let state_names: Vec<String> = (0..=ENZYMES).map(|i| format!("S_{i}")).collect();
    let rate_names: Vec<String> = (0..=ENZYMES).map(|i| format!("dS_{i}")).collect();

    let mut body = Vec::new();
    for i in 0..=ENZYMES {
        let mut terms = Vec::new();
        if i < ENZYMES {
            terms.push(format!(
                "- vmax_{i} * S_{i} / (km_{i} + S_{i}) + kie_{i} * S_{}",
                i + 1
            ));
        }
        if i > 0 {
            let j = i - 1;
            terms.push(format!("+ vmax_{j} * S_{j} / (km_{j} + S_{j}) - kie_{j} * S_{i}"));
        }
        body.push(format!("dS_{i} = 0 {}", terms.join(" ")));
    }

    fn refs(names: &[String]) -> Vec<&str> {
        names.iter().map(String::as_str).collect::<Vec<_>>()
    }
    let variables = variable_map(
        "t",
        &refs(&constant_names),
        &refs(&state_names),
        &refs(&rate_names),
        &[],
    );
    let mut states = vec![0.0; ENZYMES + 1];
    states[0] = 1000.0;
    (
        Problem {
            constants,
            states,
            voi_end: 150.0,
        },
        body.join("\n"),
        variables,
    )
}

fn michaelis_menten_direct() -> ComputeRatesFn {
    Arc::new(|_voi, constants, rates, states, _algebraic| {
        rates.fill(0.0);
        for i in 0..ENZYMES {
            let (vmax, km, kie) = (constants[3 * i], constants[3 * i + 1], constants[3 * i + 2]);
            let flux = vmax * states[i] / (km + states[i]) - kie * states[i + 1];
            rates[i] -= flux;
            rates[i + 1] += flux;
        }
    })
}

fn robertson() -> (Problem, String, VariableMap) {
    let variables = variable_map(
        "t",
        &["k1", "k2", "k3"],
        &["y1", "y2", "y3"],
        &["dy1", "dy2", "dy3"],
        &[],
    );
    let body = "dy1 = -k1 * y1 + k3 * y2 * y3
                dy2 = k1 * y1 - k3 * y2 * y3 - k2 * y2^2
                dy3 = k2 * y2^2";
    (
        Problem {
            constants: vec![0.04, 3.0e7, 1.0e4],
            states: vec![1.0, 0.0, 0.0],
            voi_end: 40.0,
        },
        body.to_string(),
        variables,
    )
}

fn robertson_direct() -> ComputeRatesFn {
    Arc::new(|_voi, k, rates, y, _algebraic| {
        rates[0] = -k[0] * y[0] + k[2] * y[1] * y[2];
        rates[1] = k[0] * y[0] - k[2] * y[1] * y[2] - k[1] * y[1] * y[1];
        rates[2] = k[1] * y[1] * y[1];
    })
}

fn benchmark_simulations(c: &mut Criterion) {
    let mut compiler = Compiler::new().expect("host is supported");

    let cases = [
        ("Michaelis-Menten", michaelis_menten(), michaelis_menten_direct()),
        ("Robertson", robertson(), robertson_direct()),
    ];

    let mut group = c.benchmark_group("Kinetics Simulation");
    for (name, (problem, body, variables), direct) in cases {
        let layout = ArrayLayout::new(problem.constants.len(), problem.states.len(), 0);
        let compiled = compiler
            .add_function_from_text(name, &body, &variables, layout)
            .expect("benchmark model compiles")
            .as_compute_rates();

        group.bench_function(format!("{name}/Direct"), |b| {
            b.iter(|| black_box(run_simulation(&problem, Arc::clone(&direct))))
        });
        group.bench_function(format!("{name}/Compiled"), |b| {
            b.iter(|| black_box(run_simulation(&problem, Arc::clone(&compiled))))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_simulations);
criterion_main!(benches);
