// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Task Scheduler definition for the boot-time fallback task

use super::ServiceDescriptor;
use std::time::Duration;

/// Well-known SID of the LocalSystem account
const SYSTEM_SID: &str = "S-1-5-18";
/// Task Scheduler rejects restart intervals under one minute
const MIN_RESTART_INTERVAL: Duration = Duration::from_secs(60);

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn iso_duration(duration: Duration) -> String {
    format!("PT{}S", duration.as_secs())
}

/// Join arguments into a Windows command line tail.
pub(crate) fn command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"') {
                arg.clone()
            } else {
                format!("\"{}\"", arg.replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn render(service: &ServiceDescriptor) -> String {
    let policy = &service.restart_policy;
    let interval = policy.restart_interval.max(MIN_RESTART_INTERVAL);

    let arguments = if service.args.is_empty() {
        String::new()
    } else {
        format!(
            "      <Arguments>{}</Arguments>\n",
            escape(&command_line(&service.args))
        )
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Description>{description}</Description>
    <URI>\{name}</URI>
  </RegistrationInfo>
  <Triggers>
    <BootTrigger>
      <Enabled>true</Enabled>
    </BootTrigger>
  </Triggers>
  <Principals>
    <Principal id="Author">
      <UserId>{SYSTEM_SID}</UserId>
      <RunLevel>HighestAvailable</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <AllowHardTerminate>true</AllowHardTerminate>
    <StartWhenAvailable>true</StartWhenAvailable>
    <RunOnlyIfNetworkAvailable>false</RunOnlyIfNetworkAvailable>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>false</Hidden>
    <ExecutionTimeLimit>PT0S</ExecutionTimeLimit>
    <RestartOnFailure>
      <Interval>{interval}</Interval>
      <Count>{count}</Count>
    </RestartOnFailure>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{command}</Command>
{arguments}    </Exec>
  </Actions>
</Task>
"#,
        description = escape(&service.description),
        name = escape(&service.name),
        interval = iso_duration(interval),
        count = policy.max_restarts,
        command = escape(&service.executable_path.to_string_lossy()),
    )
}

/// UTF-16LE with a byte order mark, the encoding `schtasks /XML` expects.
pub fn encode_utf16le(xml: &str) -> Vec<u8> {
    std::iter::once(0xFEFF_u16)
        .chain(xml.encode_utf16())
        .flat_map(u16::to_le_bytes)
        .collect()
}
