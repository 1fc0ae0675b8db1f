//! Generation by spawning an external program.
//!
//! The program is called as
//! `<command...> --prompt P --steps N --guidance-scale G --seed S --output-dir D`
//! and must write a sequence directory to `D` containing at least `final.png`.
//! Its stdout and stderr go to `D/generation.log`.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::{GenerationCollaborator, GenerationFailure, GenerationOutput, GenerationRequest};
use crate::artifact::SequenceMetadata;
use crate::artifact::layout::{FINAL_IMAGE, METADATA_FILE};

/// Default per-generation timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

const LOG_FILE: &str = "generation.log";

/// Lines of the log quoted in a failure message.
const LOG_TAIL_LINES: usize = 20;

/// Runs a generator program once per request.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandGenerator {
    /// `command[0]` is the program, the rest are leading arguments.
    pub fn new(command: &[String]) -> Result<Self, GenerationFailure> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GenerationFailure::new("generation command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, request: &GenerationRequest, output_dir: &Path) -> Result<(), GenerationFailure> {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            GenerationFailure::new(format!("cannot create {}: {e}", output_dir.display()))
        })?;
        let log_path = output_dir.join(LOG_FILE);
        let log = File::create(&log_path)
            .map_err(|e| GenerationFailure::new(format!("cannot create {}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| GenerationFailure::new(format!("cannot share log handle: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--prompt")
            .arg(&request.prompt)
            .arg("--steps")
            .arg(request.steps.to_string())
            .arg("--guidance-scale")
            .arg(request.guidance_scale.to_string())
            .arg("--seed")
            .arg(request.seed.to_string())
            .arg("--output-dir")
            .arg(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| GenerationFailure::new(format!("failed to spawn {}: {e}", self.program)))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(GenerationFailure::new(format!(
                            "generator timed out after {:.1}s",
                            self.timeout.as_secs_f64()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(GenerationFailure::new(format!(
                        "failed to wait on generator: {e}"
                    )));
                }
            }
        };

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(GenerationFailure::new(format!(
                "generator exited with status {code}{}",
                log_tail(&log_path)
            )));
        }
        Ok(())
    }
}

/// Last lines of the generator log, formatted for an error message.
fn log_tail(path: &Path) -> String {
    let mut text = String::new();
    if File::open(path)
        .and_then(|mut f| f.read_to_string(&mut text))
        .is_err()
        || text.trim().is_empty()
    {
        return String::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    format!("\n{}", lines[start..].join("\n"))
}

impl GenerationCollaborator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationFailure> {
        let output_dir = request
            .output_dir
            .as_deref()
            .ok_or_else(|| GenerationFailure::new("command generator needs an output directory"))?;

        let started = Instant::now();
        self.run(request, output_dir)?;
        tracing::debug!(
            program = %self.program,
            dir = %output_dir.display(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "generator finished"
        );

        let final_path = output_dir.join(FINAL_IMAGE);
        let final_image = image::open(&final_path)
            .map_err(|e| {
                GenerationFailure::new(format!("cannot read {}: {e}", final_path.display()))
            })?
            .to_rgb8();

        let metadata_path = output_dir.join(METADATA_FILE);
        let metadata = std::fs::read(&metadata_path)
            .ok()
            .and_then(|bytes| SequenceMetadata::from_json(&bytes, &metadata_path).ok());

        Ok(GenerationOutput {
            final_image,
            step_images: Vec::new(),
            metadata,
            output_dir: Some(output_dir.to_path_buf()),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &Path) -> GenerationRequest {
        GenerationRequest {
            prompt: "a red fox".into(),
            steps: 4,
            guidance_scale: 7.5,
            seed: 11,
            output_dir: Some(dir.join("run")),
        }
    }

    fn shell(script: &str) -> CommandGenerator {
        // `sh -c script gen`: request flags land in $1..$10, output dir is ${10}.
        CommandGenerator::new(&["/bin/sh".into(), "-c".into(), script.into(), "gen".into()])
            .unwrap()
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandGenerator::new(&[]).is_err());
    }

    #[test]
    fn copies_final_image_from_output_dir() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture.png");
        image::RgbImage::from_pixel(3, 2, image::Rgb([1, 2, 3]))
            .save(&fixture)
            .unwrap();

        let script = format!(r#"echo "prompt=$2 seed=$8"; cp "{}" "${{10}}/final.png""#, fixture.display());
        let mut generator = shell(&script);
        let out = generator.generate(&request(dir.path())).unwrap();

        assert_eq!(out.final_image.dimensions(), (3, 2));
        assert!(out.metadata.is_none());
        let log = std::fs::read_to_string(dir.path().join("run").join(LOG_FILE)).unwrap();
        assert!(log.contains("prompt=a red fox seed=11"));
    }

    #[test]
    fn non_zero_exit_is_a_failure_with_log_tail() {
        let dir = TempDir::new().unwrap();
        let mut generator = shell("echo 'CUDA out of memory' >&2; exit 3");
        let err = generator.generate(&request(dir.path())).unwrap_err();
        assert!(err.message.contains("status 3"));
        assert!(err.message.contains("CUDA out of memory"));
    }

    #[test]
    fn slow_generator_times_out() {
        let dir = TempDir::new().unwrap();
        let mut generator = shell("sleep 5").with_timeout(Duration::from_millis(200));
        let err = generator.generate(&request(dir.path())).unwrap_err();
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn missing_final_image_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let mut generator = shell("true");
        let err = generator.generate(&request(dir.path())).unwrap_err();
        assert!(err.message.contains("final.png"));
    }
}
