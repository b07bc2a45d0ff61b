//! Per-conversion rendering context.
//!
//! Holds the template environment (loader, helpers, guard-aware `range` and
//! include accounting), the
//! variables visible to templates and the out-parameters filled in while
//! rendering. One context is built for each conversion call and dropped with
//! it.

use std::sync::Arc;

use minijinja::value::Value;
use minijinja::{AutoEscape, Environment, Error, ErrorKind};

use crate::error::RenderError;
use crate::runtime::guard::ExecutionGuard;
use crate::runtime::helpers::HelperRegistry;
use crate::runtime::values::{GuardedRange, OrderedMap};
use crate::template::{TemplateFileSystem, TemplateProvider};
use crate::trace::SchemaLog;

/// Engine function called at the top of every template source.
const ENTER_TEMPLATE: &str = "__enter_template";

/// Prefix `source` with the guard hook. No newline is added, so line numbers
/// in engine errors stay accurate.
fn guarded_source(source: &str) -> String {
    format!("{{{{ {ENTER_TEMPLATE}() }}}}{source}")
}

pub struct ConversionContext {
    env: Environment<'static>,
    variables: OrderedMap,
    guard: Arc<ExecutionGuard>,
    file_system: TemplateFileSystem,
    schema_log: SchemaLog,
}

impl ConversionContext {
    /// Create a context whose includes resolve through `provider`.
    ///
    /// # Arguments
    /// * `provider` - Source of included templates
    /// * `guard` - Limits charged by loops, includes and helper calls
    pub fn new(provider: &dyn TemplateProvider, guard: Arc<ExecutionGuard>) -> Self {
        let file_system = provider.template_file_system();
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);

        let loader_fs = file_system.clone();
        env.set_loader(move |name| Ok(loader_fs.read(name).map(|t| guarded_source(t.source()))));

        let entry_guard = guard.clone();
        env.add_function(ENTER_TEMPLATE, move || -> Result<String, Error> {
            entry_guard.enter_template()?;
            Ok(String::new())
        });

        let range_guard = guard.clone();
        env.add_function(
            "range",
            move |lower: i64, upper: Option<i64>, step: Option<i64>| -> Result<Value, Error> {
                let (start, stop) = match upper {
                    Some(upper) => (lower, upper),
                    None => (0, lower),
                };
                let step = step.unwrap_or(1);
                if step == 0 {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        "range: step must not be zero",
                    ));
                }
                Ok(Value::from_object(GuardedRange::new(
                    start,
                    stop,
                    step,
                    range_guard.clone(),
                )))
            },
        );

        Self {
            env,
            variables: OrderedMap::new(),
            guard,
            file_system,
            schema_log: SchemaLog::new(),
        }
    }

    /// Make `value` visible to templates as `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    /// Install helpers; later registrations replace earlier ones by name.
    pub fn register_helpers(&mut self, helpers: &HelperRegistry) {
        helpers.install(&mut self.env, &self.guard);
    }

    pub fn guard(&self) -> &Arc<ExecutionGuard> {
        &self.guard
    }

    pub fn file_system(&self) -> &TemplateFileSystem {
        &self.file_system
    }

    pub fn schema_log(&self) -> &SchemaLog {
        &self.schema_log
    }

    /// Compile a template under `name`, shadowing the loader for that name.
    pub fn add_template(&mut self, name: &str, source: &str) -> Result<(), RenderError> {
        self.env
            .add_template_owned(name.to_string(), guarded_source(source))?;
        Ok(())
    }

    /// Render the template `name` against the context variables.
    ///
    /// An interrupted guard takes precedence over whatever the engine
    /// returned, then a failed schema validation, then the engine error.
    pub fn render(&self, name: &str) -> Result<String, RenderError> {
        let result = self
            .env
            .get_template(name)
            .and_then(|template| template.render(self.variables.clone().into_value()));

        if let Some(interrupted) = self.guard.render_error() {
            return Err(interrupted);
        }
        result.map_err(|err| match self.schema_log.failure() {
            Some(failure) => RenderError::SchemaValidation {
                schema: failure.schema,
                errors: failure.errors,
            },
            None => RenderError::Engine(err),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::MemoryTemplateProvider;
    use crate::trace::SchemaValidation;
    use minijinja::State;

    fn context(provider: &MemoryTemplateProvider, guard: ExecutionGuard) -> ConversionContext {
        ConversionContext::new(provider, Arc::new(guard))
    }

    #[test]
    fn test_render_with_variables_and_includes() {
        let provider = MemoryTemplateProvider::new().with_template("Partials/Name", "{{ name }}!");
        let mut ctx = context(&provider, ExecutionGuard::unbounded());
        ctx.insert("name", Value::from("Jane"));
        ctx.add_template("Root", "Hello {% include 'Partials/Name' %}").unwrap();

        assert!(ctx.contains("name"));
        assert_eq!(ctx.render("Root").unwrap(), "Hello Jane!");
    }

    #[test]
    fn test_output_is_not_escaped() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::unbounded());
        ctx.insert("v", Value::from("<a & \"b\">"));
        ctx.add_template("Root.json", "{{ v }}").unwrap();
        assert_eq!(ctx.render("Root.json").unwrap(), "<a & \"b\">");
    }

    #[test]
    fn test_missing_include_is_engine_error() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::unbounded());
        ctx.add_template("Root", "{% include 'Nope' %}").unwrap();
        let err = ctx.render("Root").unwrap_err();
        assert!(matches!(err, RenderError::Engine(e) if e.kind() == ErrorKind::TemplateNotFound));
    }

    #[test]
    fn test_syntax_error_surfaces_on_add() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::unbounded());
        assert!(matches!(
            ctx.add_template("Root", "{% for %}"),
            Err(RenderError::Engine(_))
        ));
    }

    #[test]
    fn test_range_counts_against_iteration_limit() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::new(None, 10));
        ctx.add_template(
            "Root",
            "{% for i in range(3) %}{{ i }}{% endfor %}|{% for i in range(10, 0, -5) %}{{ i }}{% endfor %}",
        )
        .unwrap();
        assert_eq!(ctx.render("Root").unwrap(), "012|105");

        let mut ctx = context(&provider, ExecutionGuard::new(None, 10));
        ctx.add_template("Root", "{% for i in range(1000) %}{{ i }}{% endfor %}")
            .unwrap();
        assert!(matches!(
            ctx.render("Root"),
            Err(RenderError::IterationLimit { limit: 10 })
        ));
    }

    #[test]
    fn test_includes_count_against_iteration_limit() {
        let provider = MemoryTemplateProvider::new().with_template("Leaf", "x");
        let mut ctx = context(&provider, ExecutionGuard::new(None, 3));
        ctx.add_template("Root", "{% include 'Leaf' %}{% include 'Leaf' %}{% include 'Leaf' %}")
            .unwrap();
        assert_eq!(ctx.render("Root").unwrap(), "xxx");
        assert_eq!(ctx.guard().iterations(), 3);

        let mut ctx = context(&provider, ExecutionGuard::new(None, 3));
        ctx.add_template("Root", "{% for _ in [1, 2, 3, 4] %}{% include 'Leaf' %}{% endfor %}")
            .unwrap();
        assert!(matches!(
            ctx.render("Root"),
            Err(RenderError::IterationLimit { limit: 3 })
        ));
    }

    #[test]
    fn test_self_include_stops_at_iteration_limit() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::new(None, 10));
        ctx.add_template("Self", "a{% include 'Self' %}").unwrap();
        assert!(matches!(
            ctx.render("Self"),
            Err(RenderError::IterationLimit { limit: 10 })
        ));
    }

    #[test]
    fn test_syntax_error_line_is_preserved() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::unbounded());
        match ctx.add_template("Root", "ok\n{% for %}") {
            Err(RenderError::Engine(e)) => assert_eq!(e.line(), Some(2)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_custom_helpers_override_earlier_ones() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::unbounded());
        ctx.register_helpers(&HelperRegistry::common());
        let mut custom = HelperRegistry::new();
        custom.register("match", |_: &State, _: &[Value]| Ok(Value::from("custom")));
        ctx.register_helpers(&custom);
        ctx.add_template("Root", "{{ match('a', 'a') }}").unwrap();
        assert_eq!(ctx.render("Root").unwrap(), "custom");
    }

    #[test]
    fn test_schema_failure_takes_precedence_over_engine_error() {
        let provider = MemoryTemplateProvider::new();
        let mut ctx = context(&provider, ExecutionGuard::unbounded());
        ctx.schema_log().record(SchemaValidation {
            schema: "Schemas/Patient".to_string(),
            valid: false,
            errors: vec!["missing id".to_string()],
        });
        ctx.add_template("Root", "{{ fail() }}").unwrap();
        match ctx.render("Root") {
            Err(RenderError::SchemaValidation { schema, errors }) => {
                assert_eq!(schema, "Schemas/Patient");
                assert_eq!(errors, vec!["missing id"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
