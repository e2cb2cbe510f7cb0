//! Opening ports in the security groups of a node.

use std::process::Command;

use log::{debug, info};

use serde::Deserialize;

use crate::error::InstallError;

/// An inbound rule of a security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
}

impl IngressRule {
    /// Allow TCP on `port` from anywhere.
    pub fn tcp(port: u16) -> Self {
        IngressRule {
            protocol: "tcp".into(),
            from_port: port,
            to_port: port,
            cidr: "0.0.0.0/0".into(),
        }
    }
}

/// The cloud API for security groups.
pub trait Firewall: Send + Sync {
    /// Does `group` already allow everything `rule` allows?
    fn has_permission(&self, group: &str, rule: &IngressRule) -> Result<bool, failure::Error>;

    /// Add `rule` to `group`.
    fn authorize(&self, group: &str, rule: &IngressRule) -> Result<(), failure::Error>;
}

/// Make sure every group in `groups` accepts TCP on every port in `ports` from anywhere. Only
/// missing rules are added. Returns the number of rules added.
pub fn ensure_ports_open(
    firewall: &dyn Firewall,
    groups: &[String],
    ports: &[u16],
) -> Result<usize, failure::Error> {
    let mut added = 0;

    for group in groups {
        for &port in ports {
            let rule = IngressRule::tcp(port);
            if firewall.has_permission(group, &rule)? {
                debug!("{} already allows tcp/{}", group, port);
                continue;
            }

            info!("Opening tcp/{} in {}", port, group);
            firewall.authorize(group, &rule)?;
            added += 1;
        }
    }

    Ok(added)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroups {
    security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroup {
    group_id: String,
    #[serde(default)]
    ip_permissions: Vec<IpPermission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpPermission {
    ip_protocol: String,
    from_port: Option<i32>,
    to_port: Option<i32>,
    #[serde(default)]
    ip_ranges: Vec<IpRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpRange {
    cidr_ip: String,
}

impl IpPermission {
    fn covers(&self, rule: &IngressRule) -> bool {
        // "-1" means all protocols and all ports.
        let all = self.ip_protocol == "-1";
        let protocol = all || self.ip_protocol == rule.protocol;
        let ports = all
            || match (self.from_port, self.to_port) {
                (Some(from), Some(to)) => {
                    from <= i32::from(rule.from_port) && i32::from(rule.to_port) <= to
                }
                _ => false,
            };
        let source = self.ip_ranges.iter().any(|r| r.cidr_ip == rule.cidr);

        protocol && ports && source
    }
}

/// Whether the security groups in the output of `aws ec2 describe-security-groups` give `group`
/// a permission covering `rule`.
fn described_permission(json: &str, group: &str, rule: &IngressRule) -> Result<bool, failure::Error> {
    let described: DescribeSecurityGroups = serde_json::from_str(json)?;

    Ok(described
        .security_groups
        .iter()
        .filter(|g| g.group_id == group)
        .flat_map(|g| g.ip_permissions.iter())
        .any(|perm| perm.covers(rule)))
}

/// A `Firewall` driving the `aws` command line tool on the local machine, with whatever
/// credentials it is configured with.
pub struct AwsCli {
    region: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<String>) -> Self {
        AwsCli { region }
    }

    fn aws(&self, args: &[&str]) -> Result<String, failure::Error> {
        let mut cmd = Command::new("aws");
        cmd.args(args);
        if let Some(region) = &self.region {
            cmd.args(&["--region", region.as_str()]);
        }

        let cmd_str = format!("aws {}", args.join(" "));
        debug!("{}", cmd_str);

        let output = cmd.output()?;
        if !output.status.success() {
            return Err(InstallError::CloudApi {
                cmd: cmd_str,
                stderr: String::from_utf8_lossy(&output.stderr).trim().into(),
            }
            .into());
        }

        Ok(String::from_utf8(output.stdout)?)
    }
}

impl Firewall for AwsCli {
    fn has_permission(&self, group: &str, rule: &IngressRule) -> Result<bool, failure::Error> {
        let json = self.aws(&[
            "ec2",
            "describe-security-groups",
            "--group-ids",
            group,
            "--output",
            "json",
        ])?;

        described_permission(&json, group, rule)
    }

    fn authorize(&self, group: &str, rule: &IngressRule) -> Result<(), failure::Error> {
        let port = if rule.from_port == rule.to_port {
            rule.from_port.to_string()
        } else {
            format!("{}-{}", rule.from_port, rule.to_port)
        };

        self.aws(&[
            "ec2",
            "authorize-security-group-ingress",
            "--group-id",
            group,
            "--protocol",
            &rule.protocol,
            "--port",
            &port,
            "--cidr",
            &rule.cidr,
        ])?;

        Ok(())
    }
}

#[cfg(test)]
pub mod test_util {
    use std::sync::Mutex;

    use super::{Firewall, IngressRule};

    /// Security groups kept in memory.
    #[derive(Debug, Default)]
    pub struct MockFirewall {
        pub rules: Mutex<Vec<(String, IngressRule)>>,
    }

    impl Firewall for MockFirewall {
        fn has_permission(&self, group: &str, rule: &IngressRule) -> Result<bool, failure::Error> {
            Ok(self
                .rules
                .lock()
                .unwrap()
                .iter()
                .any(|(g, r)| g == group && r == rule))
        }

        fn authorize(&self, group: &str, rule: &IngressRule) -> Result<(), failure::Error> {
            self.rules
                .lock()
                .unwrap()
                .push((group.to_owned(), rule.clone()));
            Ok(())
        }
    }
}
