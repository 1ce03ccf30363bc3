//! HTML directory listings

use crate::error::{Error, Result};
use std::path::Path;

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Index of {{dirPath}}</title></head>
<body>
<h1>Index of {{dirPath}}</h1>
<ul>{{fileLinks}}</ul>
</body>
</html>
"#;

/// Renders a directory as an HTML page from a template with `{{dirPath}}`
/// and `{{fileLinks}}` placeholders.
#[derive(Debug, Clone)]
pub struct DirectoryLister {
    template: String,
}

impl Default for DirectoryLister {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl DirectoryLister {
    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Load the template at `path`, or use the built-in one.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => std::fs::read_to_string(path)
                .map(Self::with_template)
                .map_err(|e| {
                    Error::Config(format!(
                        "cannot read listing template {}: {}",
                        path.display(),
                        e
                    ))
                }),
            None => Ok(Self::default()),
        }
    }

    pub async fn render(&self, dir: &Path, request_path: &str) -> Result<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let base = request_path.trim_end_matches('/');
        let links: String = names
            .iter()
            .map(|name| {
                let href = format!(
                    "{}/{}",
                    base,
                    urlencoding::encode(name.trim_end_matches('/'))
                );
                let href = if name.ends_with('/') {
                    format!("{}/", href)
                } else {
                    href
                };
                format!(
                    "<li><a href=\"{}\">{}</a></li>",
                    html_escape::encode_double_quoted_attribute(&href),
                    html_escape::encode_text(name)
                )
            })
            .collect();

        let dir_path = if request_path.is_empty() { "/" } else { request_path };
        Ok(self
            .template
            .replace("{{dirPath}}", &html_escape::encode_text(dir_path))
            .replace("{{fileLinks}}", &links))
    }
}
