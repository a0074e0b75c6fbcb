//! Policy check and execution sandbox for generated analysis code.
//!
//! - [`policy`]: static rejection of imports, dangerous builtin calls, and
//!   dunder attribute access. Runs before anything executes.
//! - [`executor`]: the [`CodeExecutor`] trait and [`PythonSandbox`], a
//!   persistent restricted Python namespace with timeout and output capture.
//! - [`outcome`]: [`ExecutionOutcome`] and the closed [`ErrorKind`] taxonomy.
//! - [`worker`]: the child-process protocol behind [`PythonSandbox`].

pub mod executor;
pub mod outcome;
pub mod policy;
pub mod worker;

pub use executor::{CodeExecutor, ExecFuture, PythonSandbox, SandboxConfig};
pub use outcome::{ErrorKind, ExceptionClass, ExecutionOutcome};
pub use policy::{PolicyEnforcer, PolicyViolation, Verdict, ViolationKind};

/// Description of the sandbox namespace given to the model, built from the
/// handles the worker actually managed to bind.
pub fn describe_capabilities(capabilities: &[String]) -> String {
    let described: Vec<String> = capabilities
        .iter()
        .map(|name| {
            let what = match name.as_str() {
                "pd" => "pandas",
                "np" => "numpy",
                "plt" => "matplotlib.pyplot (Agg backend; save figures, never show them)",
                "sns" => "seaborn",
                "datetime" => "datetime.datetime",
                "timedelta" => "datetime.timedelta",
                "math" => "math",
                "statistics" => "statistics",
                _ => "preloaded helper",
            };
            format!("- `{name}`: {what}")
        })
        .collect();
    format!(
        "Code runs in a restricted Python namespace. `df` is the loaded DataFrame.\n\
         Preloaded names:\n{}\n\
         Imports, file access, eval/exec, and dunder attributes are not available. \
         Use print() to show results.",
        described.join("\n")
    )
}
