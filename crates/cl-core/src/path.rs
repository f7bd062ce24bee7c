//! Output path formatting.
//!
//! Artifact paths are rendered from templates with `{placeholder}` fields.
//! Every field except `{base}` is sanitised to a single path component, so a
//! subject such as `../../etc` can never escape the evidence tree.

use crate::clock::CollectionClock;
use crate::error::{CoreError, CoreResult};
use cl_connectors::Platform;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_AWS_TEMPLATE: &str =
    "{base}/systems/aws/{environment}/{role}/{region}/{year}/{month}/{date}/{service}-{operation}.json";

pub const DEFAULT_SAAS_TEMPLATE: &str =
    "{base}/{category}/{system}/{environment}/{collector}/{year}/{month}/{date}/{subject}.{ext}";

pub const DEFAULT_MANIFEST_TEMPLATE: &str = "{base}/manifests/{date}/run-{run_id}.json";

/// Placeholders a template may use.
pub const PLACEHOLDERS: &[&str] = &[
    "base",
    "category",
    "system",
    "environment",
    "role",
    "region",
    "service",
    "operation",
    "collector",
    "subject",
    "ext",
    "year",
    "month",
    "month_name",
    "day",
    "date",
    "timestamp",
    "run_id",
];

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_]+)\}").expect("placeholder regex is valid"));

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[/\\:*?"<>|\x00-\x1f]"#).expect("unsafe char regex is valid"));

/// Templates for the three kinds of files a run writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTemplates {
    pub aws: String,
    pub saas: String,
    pub manifest: String,
}

impl Default for PathTemplates {
    fn default() -> Self {
        Self {
            aws: DEFAULT_AWS_TEMPLATE.to_string(),
            saas: DEFAULT_SAAS_TEMPLATE.to_string(),
            manifest: DEFAULT_MANIFEST_TEMPLATE.to_string(),
        }
    }
}

impl PathTemplates {
    /// Checks every template for unknown placeholders and unbalanced braces.
    pub fn validate(&self) -> CoreResult<()> {
        for template in [&self.aws, &self.saas, &self.manifest] {
            check_template(template)?;
        }
        Ok(())
    }
}

/// Identifies one AWS artifact.
#[derive(Debug, Clone, Copy)]
pub struct AwsArtifactKey<'a> {
    pub environment: &'a str,
    pub role: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub operation: &'a str,
}

/// Identifies one SaaS artifact.
#[derive(Debug, Clone, Copy)]
pub struct SaasArtifactKey<'a> {
    pub platform: Platform,
    pub environment: &'a str,
    pub collector: &'a str,
    pub subject: &'a str,
    pub ext: &'a str,
}

/// Renders artifact paths under a base directory for one clock.
#[derive(Debug, Clone)]
pub struct OutputPathFormatter {
    base_dir: PathBuf,
    templates: PathTemplates,
    clock: CollectionClock,
}

impl OutputPathFormatter {
    pub fn new(base_dir: impl AsRef<Path>, clock: CollectionClock) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            templates: PathTemplates::default(),
            clock,
        }
    }

    /// Replaces the templates after checking them.
    pub fn with_templates(mut self, templates: PathTemplates) -> CoreResult<Self> {
        templates.validate()?;
        self.templates = templates;
        Ok(self)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn clock(&self) -> &CollectionClock {
        &self.clock
    }

    pub fn aws_path(&self, key: &AwsArtifactKey<'_>) -> CoreResult<PathBuf> {
        let mut fields = self.date_fields();
        fields.insert("system", "aws".to_string());
        fields.insert("category", "systems".to_string());
        fields.insert("environment", key.environment.to_string());
        fields.insert("role", key.role.to_string());
        fields.insert("region", key.region.to_string());
        fields.insert("service", key.service.to_string());
        fields.insert("operation", key.operation.to_string());
        fields.insert("ext", "json".to_string());
        self.render(&self.templates.aws, &fields)
    }

    pub fn saas_path(&self, key: &SaasArtifactKey<'_>) -> CoreResult<PathBuf> {
        let mut fields = self.date_fields();
        fields.insert("category", key.platform.category().to_string());
        fields.insert("system", key.platform.to_string());
        fields.insert("environment", key.environment.to_string());
        fields.insert("collector", key.collector.to_string());
        fields.insert("subject", key.subject.to_string());
        fields.insert("ext", key.ext.to_string());
        self.render(&self.templates.saas, &fields)
    }

    pub fn manifest_path(&self, run_id: &str) -> CoreResult<PathBuf> {
        let mut fields = self.date_fields();
        fields.insert("run_id", run_id.to_string());
        self.render(&self.templates.manifest, &fields)
    }

    fn date_fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();
        fields.insert("year", self.clock.year().to_string());
        fields.insert("month", self.clock.month().to_string());
        fields.insert("month_name", self.clock.month_name());
        fields.insert("day", self.clock.day().to_string());
        fields.insert("date", self.clock.end_date());
        fields.insert("timestamp", self.clock.timestamp());
        fields
    }

    /// Substitutes `fields` into `template`.
    ///
    /// A known placeholder with no value for this kind of artifact is an
    /// error, as is a field that sanitises to nothing.
    pub fn render(
        &self,
        template: &str,
        fields: &BTreeMap<&'static str, String>,
    ) -> CoreResult<PathBuf> {
        check_template(template)?;

        let mut error = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            if name == "base" {
                return self.base_dir.to_string_lossy().into_owned();
            }
            match fields.get(name).map(|v| sanitize_component(v)) {
                Some(value) if !value.is_empty() => value,
                Some(_) => {
                    error.get_or_insert_with(|| {
                        CoreError::PathTemplate(format!("empty value for {{{}}}", name))
                    });
                    String::new()
                }
                None => {
                    error.get_or_insert_with(|| {
                        CoreError::PathTemplate(format!(
                            "{{{}}} is not available in template '{}'",
                            name, template
                        ))
                    });
                    String::new()
                }
            }
        });

        match error {
            Some(err) => Err(err),
            None => Ok(PathBuf::from(rendered.into_owned())),
        }
    }
}

fn check_template(template: &str) -> CoreResult<()> {
    for caps in PLACEHOLDER.captures_iter(template) {
        if !PLACEHOLDERS.contains(&&caps[1]) {
            return Err(CoreError::PathTemplate(format!(
                "unknown placeholder {{{}}} in '{}'",
                &caps[1], template
            )));
        }
    }
    let stripped = PLACEHOLDER.replace_all(template, "");
    if stripped.contains('{') || stripped.contains('}') {
        return Err(CoreError::PathTemplate(format!(
            "unbalanced braces in '{}'",
            template
        )));
    }
    Ok(())
}

/// Reduces a value to one safe path component.
pub fn sanitize_component(value: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(value.trim(), "_");
    let mut component = replaced.replace("..", "_");
    if component == "." {
        component = "_".to_string();
    }
    component
}
