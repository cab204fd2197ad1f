//! Google Cloud provider backed by the `gcloud` CLI

use super::{
    InstanceSpec, NodeProvisioner, NodeRequest, NodeSource, SecretChannel, SecretOptions,
    TemplateProvisioner, TemplateRequest,
};
use crate::error::{DeployError, Result};
use crate::swarm::node::{Node, Template};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Instance as reported by `gcloud compute instances create --format=json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResource {
    name: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateResource {
    name: String,
    self_link: String,
}

/// Files holding instance metadata for one invocation, removed on drop
struct MetadataFiles {
    script: NamedTempFile,
    ssh_keys: NamedTempFile,
}

impl MetadataFiles {
    fn write(spec: &InstanceSpec) -> Result<Self> {
        Ok(Self {
            script: metadata_file("-startup.sh", &spec.script)?,
            ssh_keys: metadata_file("-ssh-keys", &spec.ssh_metadata)?,
        })
    }

    fn script(&self) -> &Path {
        self.script.path()
    }

    fn ssh_keys(&self) -> &Path {
        self.ssh_keys.path()
    }
}

fn metadata_file(suffix: &str, content: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("swarm-deploy-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Provider that shells out to `gcloud`
#[derive(Debug, Clone)]
pub struct GcloudProvider {
    binary: PathBuf,
    project: Option<String>,
}

impl Default for GcloudProvider {
    fn default() -> Self {
        Self::new("gcloud", None)
    }
}

impl GcloudProvider {
    /// Create a provider using the given binary and optional project
    pub fn new(binary: impl Into<PathBuf>, project: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            project,
        }
    }

    fn with_project(&self, mut args: Vec<String>) -> Vec<String> {
        if let Some(project) = &self.project {
            args.push(format!("--project={}", project));
        }
        args
    }

    /// Arguments for `gcloud compute instances create`
    fn instance_args(&self, request: &NodeRequest, files: Option<&MetadataFiles>) -> Vec<String> {
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "create".to_string(),
            request.name.clone(),
            format!("--zone={}", request.zone),
        ];

        match (&request.source, files) {
            (NodeSource::Image(spec), Some(files)) => {
                args.push(format!("--machine-type={}", spec.machine_type));
                args.extend(image_args(&spec.image));
                args.push(format!("--subnet={}", spec.subnet_id));
                args.push(metadata_arg(files));
                args.extend(identity_args(spec.identity.as_deref()));
            }
            (NodeSource::Template(template), _) => {
                args.push(format!("--source-instance-template={}", template.self_link));
            }
            (NodeSource::Image(_), None) => {}
        }

        args.push("--format=json".to_string());
        self.with_project(args)
    }

    /// Arguments for `gcloud compute instance-templates create`
    fn template_args(&self, request: &TemplateRequest, files: &MetadataFiles) -> Vec<String> {
        let spec = &request.instance;
        let mut args = vec![
            "compute".to_string(),
            "instance-templates".to_string(),
            "create".to_string(),
            request.template_name(),
            format!("--region={}", request.region),
            format!("--machine-type={}", spec.machine_type),
        ];
        args.extend(image_args(&spec.image));
        args.push(format!("--subnet={}", spec.subnet_id));
        args.push(metadata_arg(files));
        args.extend(identity_args(spec.identity.as_deref()));
        args.push("--format=json".to_string());
        self.with_project(args)
    }

    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Output> {
        tracing::debug!("Running {} {}", self.binary.display(), args.join(" "));

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(|e| {
            DeployError::Command(format!("failed to start {}: {}", self.binary.display(), e))
        })?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).await?;
            pipe.shutdown().await?;
        }

        Ok(child.wait_with_output().await?)
    }

    async fn run_checked(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Output> {
        let output = self.run(args, stdin).await?;
        if !output.status.success() {
            let verb = args.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
            return Err(DeployError::Command(format!(
                "gcloud {} exited with {}: {}",
                verb,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

/// Image arguments; `project/family` selects the latest image in a family
fn image_args(image: &str) -> Vec<String> {
    if image.contains("projects/") {
        return vec![format!("--image={}", image)];
    }
    match image.split_once('/') {
        Some((project, family)) => vec![
            format!("--image-project={}", project),
            format!("--image-family={}", family),
        ],
        None => vec![format!("--image={}", image)],
    }
}

fn identity_args(identity: Option<&str>) -> Vec<String> {
    match identity {
        Some(account) => vec![
            format!("--service-account={}", account),
            "--scopes=cloud-platform".to_string(),
        ],
        None => vec!["--scopes=cloud-platform".to_string()],
    }
}

fn metadata_arg(files: &MetadataFiles) -> String {
    format!(
        "--metadata-from-file=startup-script={},ssh-keys={}",
        display(files.script()),
        display(files.ssh_keys())
    )
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn parse_instance(stdout: &[u8], request: &NodeRequest) -> Result<Node> {
    let instances: Vec<InstanceResource> = serde_json::from_slice(stdout)?;
    let instance = instances
        .into_iter()
        .find(|i| i.name == request.name)
        .ok_or_else(|| {
            DeployError::Command(format!("gcloud did not report instance {}", request.name))
        })?;

    let interface = instance.network_interfaces.into_iter().next().ok_or_else(|| {
        DeployError::Command(format!("instance {} has no network interface", request.name))
    })?;
    let private_address = interface.network_ip.ok_or_else(|| {
        DeployError::Command(format!("instance {} has no private address", request.name))
    })?;
    let external_address = interface
        .access_configs
        .into_iter()
        .find_map(|config| config.nat_ip);

    Ok(Node {
        name: instance.name,
        role: request.role,
        zone: request.zone.clone(),
        private_address,
        external_address,
        created_at: Utc::now(),
    })
}

fn parse_template(stdout: &[u8], request: &TemplateRequest) -> Result<Template> {
    let templates: Vec<TemplateResource> = serde_json::from_slice(stdout)?;
    let name = request.template_name();
    let template = templates
        .into_iter()
        .find(|t| t.name == name)
        .ok_or_else(|| DeployError::Command(format!("gcloud did not report template {}", name)))?;

    Ok(Template {
        name: template.name,
        self_link: template.self_link,
        script_digest: request.script_digest.clone(),
        created_at: Utc::now(),
    })
}

#[async_trait]
impl NodeProvisioner for GcloudProvider {
    async fn create_node(&self, request: &NodeRequest) -> Result<Node> {
        tracing::info!("Creating instance {} in {}", request.name, request.zone);

        let files = match &request.source {
            NodeSource::Image(spec) => Some(MetadataFiles::write(spec)?),
            NodeSource::Template(_) => None,
        };
        let args = self.instance_args(request, files.as_ref());
        let output = self.run_checked(&args, None).await?;

        parse_instance(&output.stdout, request)
    }
}

#[async_trait]
impl TemplateProvisioner for GcloudProvider {
    async fn create_template(&self, request: &TemplateRequest) -> Result<Template> {
        tracing::info!("Creating instance template {}", request.template_name());

        let files = MetadataFiles::write(&request.instance)?;
        let args = self.template_args(request, &files);
        let output = self.run_checked(&args, None).await?;

        parse_template(&output.stdout, request)
    }
}

#[async_trait]
impl SecretChannel for GcloudProvider {
    async fn exists(&self, name: &str) -> Result<bool> {
        let args = self.with_project(vec![
            "secrets".to_string(),
            "describe".to_string(),
            name.to_string(),
            "--format=json".to_string(),
        ]);
        let output = self.run(&args, None).await?;
        if output.status.success() {
            return Ok(true);
        }

        // Only a NOT_FOUND answer means absent; auth and network failures are errors
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("NOT_FOUND") {
            return Ok(false);
        }
        Err(DeployError::SecretChannel(format!(
            "gcloud secrets describe {} exited with {}: {}",
            name,
            output.status,
            stderr.trim()
        )))
    }

    async fn create(&self, name: &str, options: &SecretOptions) -> Result<()> {
        if self.exists(name).await? {
            return Ok(());
        }

        let mut args = vec![
            "secrets".to_string(),
            "create".to_string(),
            name.to_string(),
            format!("--replication-policy={}", options.replication),
        ];
        if !options.labels.is_empty() {
            let labels = options
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            args.push(format!("--labels={}", labels));
        }
        let args = self.with_project(args);
        self.run_checked(&args, None)
            .await
            .map_err(|e| DeployError::SecretChannel(e.to_string()))?;
        Ok(())
    }

    async fn put_version(&self, name: &str, data: &[u8]) -> Result<()> {
        let args = self.with_project(vec![
            "secrets".to_string(),
            "versions".to_string(),
            "add".to_string(),
            name.to_string(),
            "--data-file=-".to_string(),
        ]);
        self.run_checked(&args, Some(data))
            .await
            .map_err(|e| DeployError::SecretChannel(e.to_string()))?;
        Ok(())
    }

    async fn get_latest_version(&self, name: &str) -> Result<Vec<u8>> {
        let args = self.with_project(vec![
            "secrets".to_string(),
            "versions".to_string(),
            "access".to_string(),
            "latest".to_string(),
            format!("--secret={}", name),
        ]);
        let output = self
            .run_checked(&args, None)
            .await
            .map_err(|e| DeployError::SecretChannel(e.to_string()))?;
        Ok(output.stdout)
    }
}
