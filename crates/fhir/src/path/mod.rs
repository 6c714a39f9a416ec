//! FHIRPath subset used by mapping rules.
//!
//! Supported:
//! - member navigation, including typed choice names (`valueQuantity`)
//! - leading type names acting as a filter (`Observation.code`)
//! - `where`, `exists`, `empty`, `not`, `first`, `last`, `count`, `hasValue`
//! - `as`, `ofType`, `is`, `resolve`, `toString`
//! - `contains`, `startsWith`, `endsWith`, `extension(url)`
//! - `=`, `!=`, `~`/`==`, `and`, `or`, `|` and `[n]` indexing
//!
//! Anything else is rejected at parse or evaluation time with
//! [`FhirError::Path`].

mod eval;
mod parser;
mod tokenizer;

pub use eval::Value;
pub use parser::{BinaryOp, Expr, Literal};

use crate::graph::{NodeId, ResourceGraph};
use crate::registry::TypeDescriptor;
use crate::{FhirError, FhirResult};

/// Evaluates path expressions against resources held in a graph.
pub trait PathEvaluator: Send + Sync {
    fn evaluate(
        &self,
        graph: &ResourceGraph,
        context: &[Value],
        expression: &str,
    ) -> FhirResult<Vec<Value>>;

    fn evaluate_node(
        &self,
        graph: &ResourceGraph,
        node: NodeId,
        expression: &str,
    ) -> FhirResult<Vec<Value>> {
        self.evaluate(graph, &[Value::Node(node)], expression)
    }

    /// Evaluates and keeps only element results.
    fn evaluate_nodes(
        &self,
        graph: &ResourceGraph,
        node: NodeId,
        expression: &str,
    ) -> FhirResult<Vec<NodeId>> {
        Ok(self
            .evaluate_node(graph, node, expression)?
            .iter()
            .filter_map(Value::as_node)
            .collect())
    }
}

/// Default evaluator backed by a [`TypeDescriptor`].
pub struct FhirPath<'t> {
    types: &'t dyn TypeDescriptor,
}

impl<'t> FhirPath<'t> {
    pub fn new(types: &'t dyn TypeDescriptor) -> Self {
        Self { types }
    }

    pub fn parse(expression: &str) -> FhirResult<Expr> {
        let tokens =
            tokenizer::tokenize(expression).map_err(|message| path_error(expression, message))?;
        parser::PrattParser::new(tokens)
            .parse()
            .map_err(|message| path_error(expression, message))
    }
}

impl PathEvaluator for FhirPath<'_> {
    fn evaluate(
        &self,
        graph: &ResourceGraph,
        context: &[Value],
        expression: &str,
    ) -> FhirResult<Vec<Value>> {
        let expr = Self::parse(expression)?;
        let evaluator = eval::Evaluator {
            graph,
            types: self.types,
        };
        evaluator
            .eval(&expr, context, None)
            .map_err(|message| path_error(expression, message))
    }
}

fn path_error(expression: &str, message: String) -> FhirError {
    FhirError::Path {
        expression: expression.to_owned(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Primitive;
    use crate::registry::r4;

    struct Fixture {
        graph: ResourceGraph,
        observation: NodeId,
    }

    /// Observation with two codings, a quantity value and a subject reference.
    fn fixture() -> Fixture {
        let mut graph = ResourceGraph::new();
        let observation = graph.create("Observation");

        let code = graph.create("CodeableConcept");
        graph.replace(observation, "code", code);
        let codings = [("http://loinc.org", "85354-9"), ("http://snomed.info/sct", "75367002")];
        for (system, value) in codings {
            let coding = graph.create("Coding");
            let s = graph.create_primitive("uri", Primitive::Text(system.into()));
            let c = graph.create_primitive("code", Primitive::Text(value.into()));
            graph.replace(coding, "system", s);
            graph.replace(coding, "code", c);
            graph.append(code, "coding", coding);
        }

        let quantity = graph.create("Quantity");
        let v = graph.create_primitive("decimal", Primitive::Decimal(120.0));
        graph.replace(quantity, "value", v);
        graph.replace(observation, "value", quantity);

        let patient = graph.create("Patient");
        graph.register_url("Patient/p1", patient);
        let reference = graph.create("Reference");
        let r = graph.create_primitive("string", Primitive::Text("Patient/p1".into()));
        graph.replace(reference, "reference", r);
        graph.replace(observation, "subject", reference);

        Fixture { graph, observation }
    }

    fn eval(fx: &Fixture, expression: &str) -> Vec<Value> {
        let registry = r4().expect("registry");
        FhirPath::new(registry)
            .evaluate_node(&fx.graph, fx.observation, expression)
            .expect("evaluation")
    }

    #[test]
    fn where_with_contains_filters_codings() {
        let fx = fixture();
        let found = eval(&fx, "Observation.code.coding.where(system.toString().contains('loinc'))");
        assert_eq!(found.len(), 1);
        let codes = eval(
            &fx,
            "Observation.code.coding.where(code.toString().contains('75367002')).code",
        );
        assert_eq!(codes.len(), 1);
    }

    #[test]
    fn leading_type_name_must_match() {
        let fx = fixture();
        assert!(eval(&fx, "Patient.id").is_empty());
        assert_eq!(eval(&fx, "Observation.code").len(), 1);
    }

    #[test]
    fn choice_navigation_and_casts() {
        let fx = fixture();
        assert_eq!(eval(&fx, "Observation.valueQuantity").len(), 1);
        assert_eq!(eval(&fx, "Observation.value.as(Quantity).value").len(), 1);
        assert!(eval(&fx, "Observation.value.as(CodeableConcept)").is_empty());
        assert!(eval(&fx, "Observation.valueString").is_empty());
    }

    #[test]
    fn resolve_follows_registered_urls() {
        let fx = fixture();
        let resolved = eval(&fx, "Observation.subject.resolve()");
        assert_eq!(resolved.len(), 1);
        let Value::Node(node) = &resolved[0] else {
            panic!("expected a node, got {:?}", resolved[0]);
        };
        assert_eq!(fx.graph.type_name(*node), "Patient");
    }

    #[test]
    fn equality_and_boolean_operators() {
        let fx = fixture();
        assert_eq!(eval(&fx, "Observation.value.value = 120"), vec![Value::Boolean(true)]);
        assert_eq!(
            eval(&fx, "code.coding.exists() and code.text.empty()"),
            vec![Value::Boolean(true)]
        );
        assert_eq!(eval(&fx, "code.coding.count()"), vec![Value::Integer(2)]);
        assert_eq!(
            eval(&fx, "code.coding[1].code.toString()"),
            vec![Value::String("75367002".into())]
        );
    }

    #[test]
    fn unsupported_function_is_reported() {
        let fx = fixture();
        let registry = r4().expect("registry");
        let err = FhirPath::new(registry)
            .evaluate_node(&fx.graph, fx.observation, "code.aggregate($this)")
            .expect_err("should fail");
        match err {
            FhirError::Path { expression, message } => {
                assert_eq!(expression, "code.aggregate($this)");
                assert!(message.contains("aggregate"));
            }
            other => panic!("expected Path, got {other:?}"),
        }
    }
}
