//! Command rendering for resolved steps

use minijinja::{Environment, UndefinedBehavior, context};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Values exposed to step commands as `workflow.*`
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub uid: Uuid,
    pub parameters: &'a BTreeMap<String, String>,
}

/// Renders `{{ workflow.parameters.x }}` style placeholders
///
/// Wraps minijinja with strict undefined handling so a typo in a parameter
/// reference fails resolution instead of producing an empty string.
pub struct CommandRenderer {
    env: Environment<'static>,
}

impl Default for CommandRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        // Commands are shell text, never HTML
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);
        Self { env }
    }

    pub fn render(&self, command: &str, ctx: &RenderContext<'_>) -> Result<String, String> {
        let value = context! {
            workflow => context! {
                name => ctx.name,
                namespace => ctx.namespace,
                uid => ctx.uid.to_string(),
                parameters => ctx.parameters,
            },
        };

        self.env
            .render_str(command, value)
            .map_err(|e| describe_error(&e))
    }
}

fn describe_error(err: &minijinja::Error) -> String {
    let mut msg = err.to_string();
    if let Some(detail) = err.detail() {
        if !msg.contains(detail) {
            msg = format!("{}: {}", msg, detail);
        }
    }
    msg
}
