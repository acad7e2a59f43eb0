//! Capability interfaces the executor drives
//!
//! LEDs, GPIOs, managed devices, remote shells and local commands are
//! reached only through these traits. A capability left unset in
//! [`Capabilities`] makes actions that need it fail instead of panic.

use crate::action::{DeviceCommand, Rgb};
use crate::ssh::SshTarget;
use async_trait::async_trait;
use hub_core::{HubError, HubResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait LedController: Send + Sync {
    /// Set one LED, or every LED of the device when `index` is 255
    async fn set_color(&self, device: &str, index: u8, color: Rgb) -> HubResult<()>;

    async fn run_effect(
        &self,
        device: &str,
        effect: &str,
        color: Option<Rgb>,
        duration_ms: Option<u64>,
    ) -> HubResult<()>;
}

#[async_trait]
pub trait GpioController: Send + Sync {
    async fn set_level(&self, pin: u32, level: bool) -> HubResult<()>;
}

#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn control(&self, device: &str, command: DeviceCommand) -> HubResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait SshExecutor: Send + Sync {
    async fn exec(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> HubResult<CommandOutput>;
}

#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> HubResult<CommandOutput>;
}

#[derive(Clone, Default)]
pub struct Capabilities {
    pub led: Option<Arc<dyn LedController>>,
    pub gpio: Option<Arc<dyn GpioController>>,
    pub device: Option<Arc<dyn DeviceController>>,
    pub ssh: Option<Arc<dyn SshExecutor>>,
    pub cli: Option<Arc<dyn CliRunner>>,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    /// Capabilities available on a plain host: hardware is logged only,
    /// SSH goes through the `ssh` binary and CLI through `sh -c`
    pub fn host_defaults(ssh_key_dir: Option<PathBuf>) -> Self {
        let driver = Arc::new(LoggingDriver);
        Self {
            led: Some(driver.clone()),
            gpio: Some(driver.clone()),
            device: Some(driver),
            ssh: Some(Arc::new(OpenSshExecutor::new(ssh_key_dir))),
            cli: Some(Arc::new(ProcessCliRunner)),
        }
    }

    pub fn with_led(mut self, led: Arc<dyn LedController>) -> Self {
        self.led = Some(led);
        self
    }

    pub fn with_gpio(mut self, gpio: Arc<dyn GpioController>) -> Self {
        self.gpio = Some(gpio);
        self
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceController>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_ssh(mut self, ssh: Arc<dyn SshExecutor>) -> Self {
        self.ssh = Some(ssh);
        self
    }

    pub fn with_cli(mut self, cli: Arc<dyn CliRunner>) -> Self {
        self.cli = Some(cli);
        self
    }
}

/// Hardware stand-in that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDriver;

#[async_trait]
impl LedController for LoggingDriver {
    async fn set_color(&self, device: &str, index: u8, color: Rgb) -> HubResult<()> {
        info!(device, index, %color, "LED set");
        Ok(())
    }

    async fn run_effect(
        &self,
        device: &str,
        effect: &str,
        color: Option<Rgb>,
        duration_ms: Option<u64>,
    ) -> HubResult<()> {
        info!(device, effect, color = ?color.map(|c| c.to_string()), ?duration_ms, "LED effect");
        Ok(())
    }
}

#[async_trait]
impl GpioController for LoggingDriver {
    async fn set_level(&self, pin: u32, level: bool) -> HubResult<()> {
        info!(pin, level, "GPIO set");
        Ok(())
    }
}

#[async_trait]
impl DeviceController for LoggingDriver {
    async fn control(&self, device: &str, command: DeviceCommand) -> HubResult<()> {
        info!(device, command = command.as_str(), "Device control");
        Ok(())
    }
}

async fn run_process(mut cmd: Command, timeout: Duration, what: &str) -> HubResult<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| HubError::Timeout(format!("{what} exceeded {}ms", timeout.as_millis())))?
        .map_err(|e| HubError::Internal(format!("failed to spawn {what}: {e}")))?;

    Ok(CommandOutput {
        // Killed by a signal
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs commands through `sh -c`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCliRunner;

#[async_trait]
impl CliRunner for ProcessCliRunner {
    async fn run(&self, command: &str, timeout: Duration) -> HubResult<CommandOutput> {
        debug!(command, "Running local command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_process(cmd, timeout, "command").await
    }
}

/// Runs remote commands with the system `ssh` client in batch mode
///
/// Only key authentication is supported; `key_id` names a file in the key
/// directory. Host key trust is left to the client's known_hosts.
#[derive(Debug, Clone, Default)]
pub struct OpenSshExecutor {
    key_dir: Option<PathBuf>,
}

impl OpenSshExecutor {
    pub fn new(key_dir: Option<PathBuf>) -> Self {
        Self { key_dir }
    }
}

const SSH_EXIT_CONNECT_FAILED: i32 = 255;

#[async_trait]
impl SshExecutor for OpenSshExecutor {
    async fn exec(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> HubResult<CommandOutput> {
        if target.password.is_some() && target.key_id.is_none() {
            return Err(HubError::Connection(format!(
                "{}: password authentication is not supported",
                target.host
            )));
        }

        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"])
            .arg("-p")
            .arg(target.port.to_string());
        if let (Some(dir), Some(key)) = (&self.key_dir, &target.key_id) {
            cmd.arg("-i").arg(dir.join(key));
        }
        cmd.arg(format!("{}@{}", target.username, target.host))
            .arg(command);

        debug!(host = %target.host, port = target.port, command, "Running remote command");
        let out = run_process(cmd, timeout, "ssh").await?;

        if out.exit_code == SSH_EXIT_CONNECT_FAILED {
            if out.stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED") {
                return Err(HubError::HostKeyMismatch(target.host.clone()));
            }
            if out.stderr.contains("Host key verification failed") {
                return Err(HubError::HostKeyNew(target.host.clone()));
            }
            if out.stdout.is_empty() {
                return Err(HubError::Connection(format!(
                    "{}: {}",
                    target.host,
                    out.stderr.trim()
                )));
            }
        }
        Ok(out)
    }
}

/// Recording capability implementations for tests
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LedCall {
        pub device: String,
        pub index: u8,
        pub color: Option<Rgb>,
        pub effect: Option<String>,
    }

    #[derive(Default)]
    pub struct MockLed {
        calls: Mutex<Vec<LedCall>>,
    }

    impl MockLed {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> Vec<LedCall> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl LedController for MockLed {
        async fn set_color(&self, device: &str, index: u8, color: Rgb) -> HubResult<()> {
            lock(&self.calls).push(LedCall {
                device: device.into(),
                index,
                color: Some(color),
                effect: None,
            });
            Ok(())
        }

        async fn run_effect(
            &self,
            device: &str,
            effect: &str,
            color: Option<Rgb>,
            _duration_ms: Option<u64>,
        ) -> HubResult<()> {
            lock(&self.calls).push(LedCall {
                device: device.into(),
                index: 255,
                color,
                effect: Some(effect.into()),
            });
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockGpio {
        calls: Mutex<Vec<(u32, bool, Instant)>>,
    }

    impl MockGpio {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> Vec<(u32, bool, Instant)> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl GpioController for MockGpio {
        async fn set_level(&self, pin: u32, level: bool) -> HubResult<()> {
            lock(&self.calls).push((pin, level, Instant::now()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockDevice {
        calls: Mutex<Vec<(String, DeviceCommand)>>,
    }

    impl MockDevice {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> Vec<(String, DeviceCommand)> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl DeviceController for MockDevice {
        async fn control(&self, device: &str, command: DeviceCommand) -> HubResult<()> {
            lock(&self.calls).push((device.into(), command));
            Ok(())
        }
    }

    /// Canned command responses selected by substring
    #[derive(Default)]
    struct Responses {
        rules: Vec<(String, HubResult<CommandOutput>)>,
        delay: Option<Duration>,
    }

    impl Responses {
        fn pick(&self, command: &str) -> HubResult<CommandOutput> {
            self.rules
                .iter()
                .rev()
                .find(|(needle, _)| command.contains(needle.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| Ok(CommandOutput::success("")))
        }
    }

    #[derive(Default)]
    pub struct MockSsh {
        responses: Mutex<Responses>,
        calls: Mutex<Vec<(SshTarget, String)>>,
    }

    impl MockSsh {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Answer commands containing `needle`; later rules win
        pub fn respond(&self, needle: &str, output: CommandOutput) {
            lock(&self.responses).rules.push((needle.into(), Ok(output)));
        }

        pub fn fail(&self, needle: &str, error: HubError) {
            lock(&self.responses).rules.push((needle.into(), Err(error)));
        }

        /// Sleep before answering, to exercise timeouts
        pub fn set_delay(&self, delay: Duration) {
            lock(&self.responses).delay = Some(delay);
        }

        pub fn calls(&self) -> Vec<(SshTarget, String)> {
            lock(&self.calls).clone()
        }

        pub fn commands(&self) -> Vec<String> {
            lock(&self.calls).iter().map(|(_, c)| c.clone()).collect()
        }
    }

    #[async_trait]
    impl SshExecutor for MockSsh {
        async fn exec(
            &self,
            target: &SshTarget,
            command: &str,
            _timeout: Duration,
        ) -> HubResult<CommandOutput> {
            lock(&self.calls).push((target.clone(), command.to_string()));
            let (delay, result) = {
                let r = lock(&self.responses);
                (r.delay, r.pick(command))
            };
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            result
        }
    }

    #[derive(Default)]
    pub struct MockCli {
        responses: Mutex<Responses>,
        calls: Mutex<Vec<String>>,
    }

    impl MockCli {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn respond(&self, needle: &str, output: CommandOutput) {
            lock(&self.responses).rules.push((needle.into(), Ok(output)));
        }

        pub fn set_delay(&self, delay: Duration) {
            lock(&self.responses).delay = Some(delay);
        }

        pub fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl CliRunner for MockCli {
        async fn run(&self, command: &str, _timeout: Duration) -> HubResult<CommandOutput> {
            lock(&self.calls).push(command.to_string());
            let (delay, result) = {
                let r = lock(&self.responses);
                (r.delay, r.pick(command))
            };
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            result
        }
    }

    /// Every capability backed by a fresh recording mock
    pub struct MockCapabilities {
        pub led: Arc<MockLed>,
        pub gpio: Arc<MockGpio>,
        pub device: Arc<MockDevice>,
        pub ssh: Arc<MockSsh>,
        pub cli: Arc<MockCli>,
    }

    impl MockCapabilities {
        pub fn new() -> Self {
            Self {
                led: MockLed::new(),
                gpio: MockGpio::new(),
                device: MockDevice::new(),
                ssh: MockSsh::new(),
                cli: MockCli::new(),
            }
        }

        pub fn capabilities(&self) -> Capabilities {
            Capabilities::none()
                .with_led(self.led.clone())
                .with_gpio(self.gpio.clone())
                .with_device(self.device.clone())
                .with_ssh(self.ssh.clone())
                .with_cli(self.cli.clone())
        }
    }

    impl Default for MockCapabilities {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_cli_runner() {
        let out = ProcessCliRunner
            .run("echo hello; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_process_cli_runner_timeout() {
        let err = ProcessCliRunner
            .run("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_password_hosts_rejected() {
        let target = SshTarget {
            host: "h".into(),
            port: 22,
            username: "u".into(),
            password: Some("pw".into()),
            key_id: None,
        };
        let err = OpenSshExecutor::default()
            .exec(&target, "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Connection(_)));
    }

    #[tokio::test]
    async fn test_mock_ssh_picks_latest_rule() {
        let ssh = mock::MockSsh::new();
        ssh.respond("tail", CommandOutput::success("a"));
        ssh.respond("tail", CommandOutput::success("b"));
        let target = SshTarget {
            host: "h".into(),
            port: 22,
            username: "u".into(),
            password: None,
            key_id: None,
        };
        let out = ssh.exec(&target, "tail -n 50 x", Duration::from_secs(1)).await.unwrap();
        assert_eq!(out.stdout, "b");
        let other = ssh.exec(&target, "uptime", Duration::from_secs(1)).await.unwrap();
        assert_eq!(other.exit_code, 0);
        assert_eq!(ssh.commands().len(), 2);
    }
}
