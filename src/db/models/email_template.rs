//! Email templates with `{{ placeholder }}` substitution.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::{BTreeSet, HashMap};

use crate::db::query::find_scoped;

use super::common::{parse_string_list, serialize_string_list};

lazy_static! {
    static ref PLACEHOLDER_REGEX: Regex =
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").unwrap();
}

text_enum! {
    pub enum TemplateCategory {
        Transactional => "transactional",
        Marketing => "marketing",
        Notification => "notification",
        System => "system",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailTemplate {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub slug: String,
    pub category: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: Option<String>,
    pub variables: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Email template with its variables decoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplateResponse {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub slug: String,
    pub category: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: Option<String>,
    pub variables: Vec<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<EmailTemplate> for EmailTemplateResponse {
    fn from(t: EmailTemplate) -> Self {
        Self {
            variables: parse_string_list(&t.variables),
            id: t.id,
            organization_id: t.organization_id,
            name: t.name,
            slug: t.slug,
            category: t.category,
            subject: t.subject,
            body_html: t.body_html,
            body_text: t.body_text,
            is_active: t.is_active,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEmailTemplateRequest {
    pub name: String,
    pub slug: Option<String>,
    pub category: Option<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEmailTemplateRequest {
    pub name: Option<String>,
    pub category: Option<String>,
    pub subject: Option<String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmailTemplateFilter {
    pub category: Option<String>,
    pub is_active: Option<bool>,
    pub search: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// Placeholder names used across the given template parts, sorted and unique
pub fn extract_variables(parts: &[&str]) -> Vec<String> {
    let mut names = BTreeSet::new();
    for part in parts {
        for caps in PLACEHOLDER_REGEX.captures_iter(part) {
            names.insert(caps[1].to_string());
        }
    }
    names.into_iter().collect()
}

/// Escape text for inclusion in HTML
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn substitute(template: &str, vars: &HashMap<String, String>, escape: bool) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &Captures| {
            let value = vars.get(&caps[1]).map(String::as_str).unwrap_or_default();
            if escape {
                escape_html(value)
            } else {
                value.to_string()
            }
        })
        .into_owned()
}

impl EmailTemplate {
    pub fn variable_names(&self) -> Vec<String> {
        parse_string_list(&self.variables)
    }

    /// Render the template, or return the missing variable names
    pub fn render(&self, vars: &HashMap<String, String>) -> Result<RenderedEmail, Vec<String>> {
        let missing: Vec<String> = self
            .variable_names()
            .into_iter()
            .filter(|name| !vars.contains_key(name))
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        Ok(RenderedEmail {
            subject: substitute(&self.subject, vars, false),
            html: substitute(&self.body_html, vars, true),
            text: self.body_text.as_deref().map(|t| substitute(t, vars, false)),
        })
    }

    pub async fn create(
        db: &SqlitePool,
        organization_id: &str,
        req: &CreateEmailTemplateRequest,
        slug: &str,
        category: TemplateCategory,
    ) -> Result<EmailTemplate, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::utils::now();
        let mut parts = vec![req.subject.as_str(), req.body_html.as_str()];
        if let Some(text) = &req.body_text {
            parts.push(text);
        }
        let variables = serialize_string_list(&extract_variables(&parts));

        sqlx::query(
            r#"
            INSERT INTO email_templates (id, organization_id, name, slug, category, subject, body_html, body_text, variables, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(organization_id)
        .bind(req.name.trim())
        .bind(slug)
        .bind(category.to_string())
        .bind(&req.subject)
        .bind(&req.body_html)
        .bind(&req.body_text)
        .bind(&variables)
        .bind(req.is_active.unwrap_or(true))
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        find_scoped(db, "email_templates", organization_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Apply an update to an existing template, re-deriving its variables
    pub async fn save(
        db: &SqlitePool,
        existing: EmailTemplate,
        req: &UpdateEmailTemplateRequest,
        category: Option<TemplateCategory>,
    ) -> Result<EmailTemplate, sqlx::Error> {
        let mut t = existing;
        if let Some(name) = &req.name {
            t.name = name.trim().to_string();
        }
        if let Some(category) = category {
            t.category = category.to_string();
        }
        if let Some(subject) = &req.subject {
            t.subject = subject.clone();
        }
        if let Some(html) = &req.body_html {
            t.body_html = html.clone();
        }
        if let Some(text) = &req.body_text {
            t.body_text = Some(text.clone());
        }
        if let Some(active) = req.is_active {
            t.is_active = active;
        }

        let mut parts = vec![t.subject.as_str(), t.body_html.as_str()];
        if let Some(text) = &t.body_text {
            parts.push(text);
        }
        t.variables = serialize_string_list(&extract_variables(&parts));
        t.updated_at = crate::utils::now();

        sqlx::query(
            r#"
            UPDATE email_templates
            SET name = ?, category = ?, subject = ?, body_html = ?, body_text = ?, variables = ?, is_active = ?, updated_at = ?
            WHERE id = ? AND organization_id = ?
            "#,
        )
        .bind(&t.name)
        .bind(&t.category)
        .bind(&t.subject)
        .bind(&t.body_html)
        .bind(&t.body_text)
        .bind(&t.variables)
        .bind(t.is_active)
        .bind(&t.updated_at)
        .bind(&t.id)
        .bind(&t.organization_id)
        .execute(db)
        .await?;

        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(subject: &str, html: &str, text: Option<&str>) -> EmailTemplate {
        let mut parts = vec![subject, html];
        if let Some(t) = text {
            parts.push(t);
        }
        EmailTemplate {
            id: "t1".to_string(),
            organization_id: "o1".to_string(),
            name: "Welcome".to_string(),
            slug: "welcome".to_string(),
            category: "transactional".to_string(),
            subject: subject.to_string(),
            body_html: html.to_string(),
            body_text: text.map(str::to_string),
            variables: serialize_string_list(&extract_variables(&parts)),
            is_active: true,
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
            updated_at: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_extract_variables() {
        let vars = extract_variables(&[
            "Welcome {{ first_name }}!",
            "<p>Hi {{first_name}}, join {{ org.name }}</p>",
            "{{ not valid }} {{1abc}}",
        ]);
        assert_eq!(vars, vec!["first_name".to_string(), "org.name".to_string()]);
    }

    #[test]
    fn test_render_escapes_html_only() {
        let t = template(
            "Hello {{ name }}",
            "<p>Hello {{ name }}</p>",
            Some("Hello {{ name }}"),
        );
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "<Tom & Jerry>".to_string());

        let rendered = t.render(&vars).unwrap();
        assert_eq!(rendered.subject, "Hello <Tom & Jerry>");
        assert_eq!(rendered.html, "<p>Hello &lt;Tom &amp; Jerry&gt;</p>");
        assert_eq!(rendered.text.as_deref(), Some("Hello <Tom & Jerry>"));
    }

    #[test]
    fn test_render_reports_missing_variables() {
        let t = template("{{ a }}", "{{ b }} {{ c }}", None);
        let mut vars = HashMap::new();
        vars.insert("b".to_string(), "x".to_string());

        let missing = t.render(&vars).unwrap_err();
        assert_eq!(missing, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"a"b'c"#), "a&quot;b&#39;c");
        assert_eq!(escape_html("plain"), "plain");
    }
}
