//! Notification message rendering
//!
//! Templates use `{name}` placeholders. Unknown placeholders are left as-is.

use crate::store::{Incident, Priority};

pub const DEFAULT_SUBJECT: &str = "[{priority}] {title}";
pub const DEFAULT_BODY: &str =
    "Incident {incident_id} \"{title}\" escalated to level {level} (cycle {cycle}), target {target}";

/// Values substituted into a template
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub incident_id: &'a str,
    pub title: &'a str,
    pub priority: Priority,
    pub level: u32,
    pub cycle: u32,
    pub target: &'a str,
}

impl<'a> TemplateContext<'a> {
    pub fn for_incident(incident: &'a Incident, level: u32, cycle: u32, target: &'a str) -> Self {
        Self {
            incident_id: &incident.id,
            title: &incident.title,
            priority: incident.priority,
            level,
            cycle,
            target,
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        Some(match name {
            "incident_id" => self.incident_id.to_string(),
            "title" => self.title.to_string(),
            "priority" => self.priority.to_string(),
            "level" => self.level.to_string(),
            // Cycles are shown 1-based
            "cycle" => (self.cycle + 1).to_string(),
            "target" => self.target.to_string(),
            _ => return None,
        })
    }
}

/// Substitute `{name}` placeholders.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match ctx.lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render (subject, body) for a level, using the level's template for the body
/// when it has one.
pub fn render_message(template: Option<&str>, ctx: &TemplateContext<'_>) -> (String, String) {
    let subject = render(DEFAULT_SUBJECT, ctx);
    let body = render(template.unwrap_or(DEFAULT_BODY), ctx);
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext<'static> {
        TemplateContext {
            incident_id: "inc-7",
            title: "db down",
            priority: Priority::Critical,
            level: 2,
            cycle: 0,
            target: "scheduler:primary",
        }
    }

    #[test]
    fn test_render_placeholders() {
        assert_eq!(
            render("{title} L{level}/C{cycle} -> {target}", &ctx()),
            "db down L2/C1 -> scheduler:primary"
        );
    }

    #[test]
    fn test_unknown_and_unclosed_placeholders_kept() {
        assert_eq!(render("{nope} {title", &ctx()), "{nope} {title");
    }

    #[test]
    fn test_default_message() {
        let (subject, body) = render_message(None, &ctx());
        assert_eq!(subject, "[critical] db down");
        assert!(body.contains("inc-7"));
        assert!(body.contains("level 2"));
    }
}
