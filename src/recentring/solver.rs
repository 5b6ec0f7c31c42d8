//! Geometry solver collaborator.
//!
//! Predicts the sample translation that keeps the crystal centred at a new
//! goniostat orientation, given one centred reference orientation. The
//! production implementation shells out to an external program; tests use a
//! deterministic fake.

use crate::config::SolverConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Name of the input file written to the solver working directory.
pub const SOLVER_INPUT_FILE: &str = "temp_recen.in";

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Solver executable not configured")]
    NotConfigured,
    #[error("Solver I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Solver exited with status {code:?}")]
    ExitStatus { code: Option<i32>, output: String },
    #[error("Solver output has no normal termination marker")]
    NoNormalTermination,
    #[error("Solver output malformed: {0}")]
    MalformedOutput(String),
    #[error("Solver timed out after {0} s")]
    Timeout(u64),
}

/// Input of one translation prediction. Orientations are omega/kappa/phi
/// triples, translations x/y/z.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TranslationRequest {
    pub okp: [f64; 3],
    pub ref_okp: [f64; 3],
    pub ref_xyz: [f64; 3],
    pub home_position: [f64; 3],
    pub cross_sec_of_soc: [f64; 3],
}

#[async_trait]
pub trait GeometrySolver: Send + Sync {
    /// Predicted x/y/z translation at `request.okp`.
    async fn predict_translation(
        &self,
        request: &TranslationRequest,
    ) -> Result<[f64; 3], SolverError>;
}

/// Runs the external `recen` program.
pub struct RecenSolver {
    config: SolverConfig,
}

impl RecenSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Namelist input describing the instrument geometry.
    pub fn namelist(&self, request: &TranslationRequest) -> String {
        let gonio = &self.config.gonio_axis_dirs;
        let centring = &self.config.centring_axis_dirs;
        let mut text = String::from("&recen_list\n");
        for (name, values) in [
            ("omega_axis", axis_slice(gonio, 0)),
            ("kappa_axis", axis_slice(gonio, 1)),
            ("phi_axis", axis_slice(gonio, 2)),
            ("trans_1_axis", axis_slice(centring, 0)),
            ("trans_2_axis", axis_slice(centring, 1)),
            ("trans_3_axis", axis_slice(centring, 2)),
            ("cross_sec_of_soc", &request.cross_sec_of_soc[..]),
            ("home", &request.home_position[..]),
        ] {
            text.push_str(&format!("    {} = {}\n", name, join(values, ", ")));
        }
        text.push_str("/\n");
        text
    }

    /// Command line arguments after the executable.
    pub fn arguments(&self, input: &std::path::Path, request: &TranslationRequest) -> Vec<String> {
        vec![
            "--input".to_string(),
            input.display().to_string(),
            "--init-xyz".to_string(),
            join(&request.ref_xyz, ","),
            "--init-okp".to_string(),
            join(&request.ref_okp, ","),
            "--okp".to_string(),
            join(&request.okp, ","),
        ]
    }

    fn input_path(&self) -> PathBuf {
        self.config.working_dir.join(SOLVER_INPUT_FILE)
    }

    async fn run(&self, request: &TranslationRequest) -> Result<String, SolverError> {
        let executable = self
            .config
            .executable
            .as_ref()
            .ok_or(SolverError::NotConfigured)?;
        let input = self.input_path();
        tokio::fs::create_dir_all(&self.config.working_dir).await?;
        tokio::fs::write(&input, self.namelist(request)).await?;

        let arguments = self.arguments(&input, request);
        debug!(
            executable = %executable.display(),
            args = %arguments.join(" "),
            "Running geometry solver"
        );
        let output = Command::new(executable)
            .args(&arguments)
            .env_clear()
            .envs(&self.config.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            error!(
                code = ?output.status.code(),
                "Geometry solver failed. Output was:\n{}",
                text
            );
            return Err(SolverError::ExitStatus {
                code: output.status.code(),
                output: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl GeometrySolver for RecenSolver {
    async fn predict_translation(
        &self,
        request: &TranslationRequest,
    ) -> Result<[f64; 3], SolverError> {
        let output = match self.config.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.run(request))
                .await
                .map_err(|_| SolverError::Timeout(secs))??,
            None => self.run(request).await?,
        };
        parse_solver_output(&output).inspect_err(|err| {
            error!("Geometry solver {}. Output was:\n{}", err, output);
        })
    }
}

/// Extracts the translation from solver output.
///
/// Scanning backwards, a `NORMAL termination` line must come first; the
/// translation is the last three tokens of the nearest earlier line
/// containing `X,Y,Z`.
pub fn parse_solver_output(output: &str) -> Result<[f64; 3], SolverError> {
    let mut terminated_ok = false;
    for line in output.lines().rev() {
        let line = line.trim();
        if !terminated_ok {
            terminated_ok = line == "NORMAL termination";
            continue;
        }
        if line.contains("X,Y,Z") {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 3 {
                return Err(SolverError::MalformedOutput(line.to_string()));
            }
            let mut xyz = [0.0; 3];
            for (value, token) in xyz.iter_mut().zip(&tokens[tokens.len() - 3..]) {
                *value = token
                    .parse()
                    .map_err(|_| SolverError::MalformedOutput(line.to_string()))?;
            }
            return Ok(xyz);
        }
    }
    if terminated_ok {
        Err(SolverError::MalformedOutput(
            "no X,Y,Z line before termination".to_string(),
        ))
    } else {
        Err(SolverError::NoNormalTermination)
    }
}

fn axis_slice(dirs: &[f64], axis: usize) -> &[f64] {
    dirs.get(axis * 3..axis * 3 + 3).unwrap_or(&[])
}

fn join(values: &[f64], separator: &str) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TranslationRequest {
        TranslationRequest {
            okp: [0.0, 30.0, 90.0],
            ref_okp: [0.0, 0.0, 0.0],
            ref_xyz: [0.1, 0.2, 0.3],
            home_position: [0.0, 0.0, 0.0],
            cross_sec_of_soc: [0.0, 0.005, 0.0],
        }
    }

    #[test]
    fn test_parse_normal_output() {
        let output = "recen 1.2\n\
                      Initial X,Y,Z      0.1 0.2 0.3\n\
                      Recentred X,Y,Z    0.125 -0.5 1.75\n\
                      NORMAL termination\n";
        assert_eq!(parse_solver_output(output).unwrap(), [0.125, -0.5, 1.75]);
    }

    #[test]
    fn test_parse_requires_termination_marker() {
        let output = "Recentred X,Y,Z 0.1 0.2 0.3\n";
        assert!(matches!(
            parse_solver_output(output),
            Err(SolverError::NoNormalTermination)
        ));
    }

    #[test]
    fn test_parse_ignores_lines_after_marker() {
        let output = "NORMAL termination\nX,Y,Z 1 2 3\n";
        assert!(matches!(
            parse_solver_output(output),
            Err(SolverError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_parse_malformed_values() {
        let output = "X,Y,Z 1.0 two 3.0\nNORMAL termination\n";
        assert!(matches!(
            parse_solver_output(output),
            Err(SolverError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_arguments() {
        let solver = RecenSolver::new(SolverConfig::default());
        let args = solver.arguments(std::path::Path::new("/tmp/in.nml"), &request());
        assert_eq!(
            args,
            vec![
                "--input", "/tmp/in.nml", "--init-xyz", "0.1,0.2,0.3", "--init-okp", "0,0,0",
                "--okp", "0,30,90"
            ]
        );
    }

    #[test]
    fn test_namelist_lists_axes() {
        let solver = RecenSolver::new(SolverConfig::default());
        let text = solver.namelist(&request());
        assert!(text.starts_with("&recen_list\n"));
        assert!(text.contains("    omega_axis = 1, 0, 0\n"));
        assert!(text.contains("    cross_sec_of_soc = 0, 0.005, 0\n"));
        assert!(text.ends_with("/\n"));
    }

    #[tokio::test]
    async fn test_unconfigured_solver_fails() {
        let solver = RecenSolver::new(SolverConfig::default());
        assert!(matches!(
            solver.predict_translation(&request()).await,
            Err(SolverError::NotConfigured)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("recen");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"args $*\"\necho \"Recentred X,Y,Z 0.5 0.25 -1\"\necho \"NORMAL termination\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let solver = RecenSolver::new(SolverConfig {
            executable: Some(script),
            working_dir: dir.path().to_path_buf(),
            timeout_secs: Some(10),
            ..Default::default()
        });
        let xyz = solver.predict_translation(&request()).await.unwrap();
        assert_eq!(xyz, [0.5, 0.25, -1.0]);
        assert!(dir.path().join(SOLVER_INPUT_FILE).exists());
    }
}
