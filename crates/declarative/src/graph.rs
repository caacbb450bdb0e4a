//! Resource graph construction
//!
//! Building a stack definition runs every check that does not need state:
//! parameter constraints, reference targets, condition evaluation and
//! dependency ordering. Either the whole definition is returned or nothing.

use crate::error::{Error, ResolutionError};
use crate::expr::{
    AttributeSource, DeclaredNames, Evaluated, Evaluator, Expr, Reference, resolve_conditions,
};
use crate::parameters::{ParameterInputs, resolve_parameters};
use crate::template::{STACK_NAME, STACK_REGION, Template};
use crate::types::{Properties, PropertyValue, ResolvedProperties};
use serde_json::Value;
use statestore::DeletionPolicy;
use std::collections::{BTreeMap, BTreeSet};

/// Values behind the pseudo parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackContext {
    pub name: String,
    pub region: String,
}

/// An included resource with its dependency edges
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub logical_id: String,
    pub resource_type: String,
    pub properties: BTreeMap<String, Expr>,
    /// Resources that must exist before this one
    pub dependencies: BTreeSet<String>,
    pub deletion_policy: DeletionPolicy,
}

/// Included resources in dependency order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, GraphNode>,
    order: Vec<String>,
}

impl ResourceGraph {
    /// Build a graph, failing if the dependency edges contain a cycle
    pub fn new(nodes: BTreeMap<String, GraphNode>) -> Result<Self, ResolutionError> {
        let order = topological_order(&nodes)?;
        Ok(Self { nodes, order })
    }

    pub fn get(&self, logical_id: &str) -> Option<&GraphNode> {
        self.nodes.get(logical_id)
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.nodes.contains_key(logical_id)
    }

    /// Logical ids, dependencies before dependents
    ///
    /// Resources with no ordering constraint between them appear in logical
    /// id order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Nodes in dependency order
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Resources that directly depend on `logical_id`
    pub fn dependents(&self, logical_id: &str) -> BTreeSet<&str> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.contains(logical_id))
            .map(|n| n.logical_id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Kahn's algorithm with an ordered ready set
fn topological_order(nodes: &BTreeMap<String, GraphNode>) -> Result<Vec<String>, ResolutionError> {
    let mut remaining: BTreeMap<&str, usize> = nodes
        .iter()
        .map(|(id, node)| (id.as_str(), node.dependencies.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for node in nodes.values() {
        for dependency in &node.dependencies {
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(node.logical_id.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        remaining.remove(id);
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        Err(ResolutionError::CyclicDependency {
            cycle: find_cycle(nodes, &remaining.keys().copied().collect()),
        })
    }
}

/// Walk unsorted nodes along their dependencies until one repeats
///
/// Every node left over by the sort still has an unsorted dependency, so the
/// walk always closes a loop.
fn find_cycle(nodes: &BTreeMap<String, GraphNode>, unsorted: &BTreeSet<&str>) -> Vec<String> {
    let mut path: Vec<&str> = Vec::new();
    let mut current = unsorted.first().copied();

    while let Some(id) = current {
        if let Some(start) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
            cycle.push(id.to_string());
            return cycle;
        }
        path.push(id);
        current = nodes.get(id).and_then(|node| {
            node.dependencies
                .iter()
                .map(String::as_str)
                .find(|d| unsorted.contains(d))
        });
    }

    unsorted.iter().map(|s| (*s).to_string()).collect()
}

/// A declared output that is included in this run
#[derive(Debug, Clone, PartialEq)]
pub struct OutputNode {
    pub value: Expr,
    pub description: Option<String>,
}

/// A template resolved against parameters, ready for planning
#[derive(Debug, Clone)]
pub struct StackDefinition {
    pub name: String,
    /// Declared parameters after validation
    pub parameters: BTreeMap<String, Value>,
    pub conditions: BTreeMap<String, bool>,
    pub graph: ResourceGraph,
    pub outputs: BTreeMap<String, OutputNode>,
    /// Digest of the template and parameter values
    pub digest: String,
    /// Parameters plus pseudo parameters, as seen by expressions
    scope: BTreeMap<String, Value>,
}

impl StackDefinition {
    /// Resolve a template into a definition
    pub fn build(
        template: &Template,
        inputs: &ParameterInputs,
        context: &StackContext,
    ) -> Result<Self, Error> {
        template.check()?;
        let parameters = resolve_parameters(&template.parameters, inputs)?;

        let mut scope = parameters.clone();
        scope.insert(STACK_NAME.to_string(), Value::String(context.name.clone()));
        scope.insert(STACK_REGION.to_string(), Value::String(context.region.clone()));

        let declared = DeclaredNames {
            parameters: scope.keys().cloned().collect(),
            resources: template.resources.keys().cloned().collect(),
            conditions: template.conditions.keys().cloned().collect(),
        };

        // Parse and check every expression before evaluating any of them.
        let condition_exprs = Expr::parse_map(&template.conditions, "Conditions")?;
        for (name, expr) in &condition_exprs {
            declared.check(expr, name)?;
            if let Some(resource) = expr
                .references(None)
                .iter()
                .filter_map(Reference::target)
                .find(|t| declared.resources.contains(*t) && !declared.parameters.contains(*t))
            {
                return Err(ResolutionError::InvalidExpression {
                    from: name.clone(),
                    message: format!("conditions cannot reference resource '{resource}'"),
                }
                .into());
            }
        }

        let mut resource_exprs = BTreeMap::new();
        for (id, spec) in &template.resources {
            let properties = Expr::parse_map(&spec.properties, id)?;
            for expr in properties.values() {
                declared.check(expr, id)?;
            }
            if let Some(condition) = &spec.condition {
                check_condition_name(&declared, condition, id)?;
            }
            if let Some(target) = spec.depends_on.iter().find(|t| !declared.resources.contains(*t)) {
                return Err(ResolutionError::UnresolvedReference {
                    from: id.clone(),
                    target: target.clone(),
                }
                .into());
            }
            resource_exprs.insert(id.as_str(), properties);
        }

        let mut output_exprs = BTreeMap::new();
        for (name, spec) in &template.outputs {
            let value = Expr::parse(&spec.value, name)?;
            declared.check(&value, name)?;
            if let Some(condition) = &spec.condition {
                check_condition_name(&declared, condition, name)?;
            }
            output_exprs.insert(name.as_str(), value);
        }

        let conditions = resolve_conditions(&condition_exprs, &scope)?;
        let holds = |condition: &Option<String>| {
            condition
                .as_ref()
                .is_none_or(|c| conditions.get(c).copied().unwrap_or(false))
        };

        let included: BTreeSet<&str> = template
            .resources
            .iter()
            .filter(|(_, spec)| holds(&spec.condition))
            .map(|(id, _)| id.as_str())
            .collect();
        for excluded in template.resources.keys().filter(|id| !included.contains(id.as_str())) {
            log::debug!("Resource {excluded} excluded by its condition");
        }

        let mut nodes = BTreeMap::new();
        for (id, properties) in resource_exprs {
            if !included.contains(id) {
                continue;
            }
            let spec = &template.resources[id];
            let mut dependencies = BTreeSet::new();
            let targets = properties
                .values()
                .flat_map(|expr| expr.references(Some(&conditions)))
                .filter_map(|r| r.target().map(str::to_string))
                .filter(|t| declared.resources.contains(t))
                .chain(spec.depends_on.iter().cloned());
            for target in targets {
                if !included.contains(target.as_str()) {
                    return Err(ResolutionError::UnresolvedReference {
                        from: id.to_string(),
                        target,
                    }
                    .into());
                }
                dependencies.insert(target);
            }

            nodes.insert(
                id.to_string(),
                GraphNode {
                    logical_id: id.to_string(),
                    resource_type: spec.resource_type.clone(),
                    properties,
                    dependencies,
                    deletion_policy: spec.deletion_policy,
                },
            );
        }

        let mut outputs = BTreeMap::new();
        for (name, value) in output_exprs {
            let spec = &template.outputs[name];
            if !holds(&spec.condition) {
                continue;
            }
            if let Some(target) = value
                .references(Some(&conditions))
                .iter()
                .filter_map(Reference::target)
                .find(|t| declared.resources.contains(*t) && !included.contains(t))
            {
                return Err(ResolutionError::UnresolvedReference {
                    from: name.to_string(),
                    target: target.to_string(),
                }
                .into());
            }
            outputs.insert(
                name.to_string(),
                OutputNode {
                    value,
                    description: spec.description.clone(),
                },
            );
        }

        let graph = ResourceGraph::new(nodes)?;
        log::debug!(
            "Built graph for stack '{}': {} resource(s), order {:?}",
            context.name,
            graph.len(),
            graph.order()
        );

        Ok(Self {
            name: context.name.clone(),
            digest: template.digest(&parameters),
            parameters,
            conditions,
            graph,
            outputs,
            scope,
        })
    }

    /// A definition with no resources, used to tear a stack down
    pub fn empty(context: &StackContext) -> Self {
        let template = Template::default();
        let parameters = BTreeMap::new();
        let mut scope = BTreeMap::new();
        scope.insert(STACK_NAME.to_string(), Value::String(context.name.clone()));
        scope.insert(STACK_REGION.to_string(), Value::String(context.region.clone()));
        Self {
            name: context.name.clone(),
            digest: template.digest(&parameters),
            parameters,
            conditions: BTreeMap::new(),
            graph: ResourceGraph::default(),
            outputs: BTreeMap::new(),
            scope,
        }
    }

    /// Parameters and pseudo parameters
    pub fn scope(&self) -> &BTreeMap<String, Value> {
        &self.scope
    }

    /// Resolve a resource's properties, leaving not-yet-known values unknown
    pub fn resolve_properties(
        &self,
        logical_id: &str,
        source: &dyn AttributeSource,
    ) -> Result<ResolvedProperties, ResolutionError> {
        let node = self.node(logical_id)?;
        Evaluator::new(&self.scope, &self.conditions, source)
            .evaluate_properties(&node.properties, logical_id)
    }

    /// Resolve a resource's properties to concrete values
    ///
    /// Fails with `UnavailableAttribute` if anything is still unknown.
    pub fn concrete_properties(
        &self,
        logical_id: &str,
        source: &dyn AttributeSource,
    ) -> Result<Properties, ResolutionError> {
        let node = self.node(logical_id)?;
        let resolved = Evaluator::strict(&self.scope, &self.conditions, source)
            .evaluate_properties(&node.properties, logical_id)?;
        Ok(resolved
            .into_iter()
            .filter_map(|(k, v)| match v {
                PropertyValue::Known(value) => Some((k, value)),
                PropertyValue::Unknown => None,
            })
            .collect())
    }

    /// Evaluate outputs, skipping any that cannot be resolved
    pub fn resolve_outputs(&self, source: &dyn AttributeSource) -> BTreeMap<String, Value> {
        let evaluator = Evaluator::strict(&self.scope, &self.conditions, source);
        let mut values = BTreeMap::new();
        for (name, output) in &self.outputs {
            match evaluator.evaluate(&output.value, name) {
                Ok(Evaluated::Known(value)) => {
                    values.insert(name.clone(), value);
                }
                Ok(Evaluated::Omit | Evaluated::Unknown) => {}
                Err(e) => log::warn!("Output {name} not available: {e}"),
            }
        }
        values
    }

    fn node(&self, logical_id: &str) -> Result<&GraphNode, ResolutionError> {
        self.graph
            .get(logical_id)
            .ok_or_else(|| ResolutionError::UnresolvedReference {
                from: self.name.clone(),
                target: logical_id.to_string(),
            })
    }
}

fn check_condition_name(
    declared: &DeclaredNames,
    condition: &str,
    from: &str,
) -> Result<(), ResolutionError> {
    if declared.conditions.contains(condition) {
        Ok(())
    } else {
        Err(ResolutionError::UnknownCondition {
            from: from.to_string(),
            condition: condition.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Lookup;
    use crate::template::TemplateFormat;
    use serde_json::json;

    fn context() -> StackContext {
        StackContext {
            name: "demo".to_string(),
            region: "local-1".to_string(),
        }
    }

    fn build(template: Value) -> Result<StackDefinition, Error> {
        let template = Template::parse(&template.to_string(), TemplateFormat::Json)?;
        StackDefinition::build(&template, &ParameterInputs::new(), &context())
    }

    fn resource(resource_type: &str, properties: Value) -> Value {
        json!({"Type": resource_type, "Properties": properties})
    }

    #[test]
    fn test_policy_after_bucket_and_table() {
        let definition = build(json!({
            "Resources": {
                "Policy": resource("Access::Policy", json!({
                    "Bucket": {"Fn::GetAtt": ["Bucket", "Arn"]},
                    "Table": {"Fn::Sub": "${Table.Arn}"}
                })),
                "Bucket": resource("Storage::Bucket", json!({})),
                "Table": resource("Storage::Table", json!({}))
            }
        }))
        .unwrap();

        assert_eq!(definition.graph.order(), ["Bucket", "Table", "Policy"]);
        let policy = definition.graph.get("Policy").unwrap();
        assert_eq!(
            policy.dependencies,
            BTreeSet::from(["Bucket".to_string(), "Table".to_string()])
        );
        assert_eq!(
            definition.graph.dependents("Bucket"),
            BTreeSet::from(["Policy"])
        );
    }

    #[test]
    fn test_cycle_is_rejected_with_its_members() {
        let err = build(json!({
            "Resources": {
                "A": resource("T", json!({"x": {"Ref": "B"}})),
                "B": resource("T", json!({"x": {"Fn::GetAtt": "C.Arn"}})),
                "C": {"Type": "T", "DependsOn": "A"},
                "D": resource("T", json!({}))
            }
        }))
        .unwrap_err();

        match err {
            Error::Resolution(ResolutionError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["A", "B", "C", "A"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = build(json!({
            "Resources": {"A": resource("T", json!({"x": {"Ref": "A"}}))}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_dangling_reference() {
        let err = build(json!({
            "Resources": {"A": resource("T", json!({"x": {"Ref": "Ghost"}}))}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_dangling_reference_in_unchosen_branch_is_still_rejected() {
        let err = build(json!({
            "Conditions": {"Never": {"Fn::Equals": [1, 2]}},
            "Resources": {"A": resource("T", json!({
                "x": {"Fn::If": ["Never", {"Ref": "Ghost"}, 1]}
            }))}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_parameter_violation_fails_first() {
        let template = Template::parse(
            &json!({
                "Parameters": {"Env": {"Type": "Enum", "AllowedValues": ["dev", "prod"]}},
                "Resources": {"A": resource("T", json!({"x": {"Ref": "Ghost"}}))}
            })
            .to_string(),
            TemplateFormat::Json,
        )
        .unwrap();
        let inputs = ParameterInputs::from([("Env".to_string(), json!("qa"))]);
        let err = StackDefinition::build(&template, &inputs, &context()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_condition_excludes_resource_and_prunes_edges() {
        let template = json!({
            "Parameters": {"Env": {"Default": "dev"}},
            "Conditions": {"IsProd": {"Fn::Equals": [{"Ref": "Env"}, "prod"]}},
            "Resources": {
                "Replica": {"Type": "Storage::Bucket", "Condition": "IsProd"},
                "Bucket": resource("Storage::Bucket", json!({
                    "ReplicateTo": {"Fn::If": ["IsProd", {"Ref": "Replica"}, {"Ref": "Stack::NoValue"}]}
                }))
            }
        });
        let definition = build(template).unwrap();
        assert!(!definition.graph.contains("Replica"));
        assert!(definition.graph.get("Bucket").unwrap().dependencies.is_empty());
        assert!(!definition.conditions["IsProd"]);
    }

    #[test]
    fn test_reference_to_excluded_resource() {
        let err = build(json!({
            "Conditions": {"Never": {"Fn::Equals": ["a", "b"]}},
            "Resources": {
                "Replica": {"Type": "T", "Condition": "Never"},
                "Bucket": resource("T", json!({"x": {"Ref": "Replica"}}))
            }
        }))
        .unwrap_err();
        match err {
            Error::Resolution(ResolutionError::UnresolvedReference { from, target }) => {
                assert_eq!(from, "Bucket");
                assert_eq!(target, "Replica");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_condition_cannot_reference_resource() {
        let err = build(json!({
            "Conditions": {"C": {"Fn::Equals": [{"Ref": "A"}, "x"]}},
            "Resources": {"A": {"Type": "T"}}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_undeclared_resource_condition() {
        let err = build(json!({
            "Resources": {"A": {"Type": "T", "Condition": "Missing"}}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::UnknownCondition { .. })
        ));
    }

    #[test]
    fn test_pseudo_parameters_and_outputs() {
        struct Created;
        impl AttributeSource for Created {
            fn physical_id(&self, logical_id: &str) -> Lookup {
                Lookup::Known(json!(format!("{logical_id}-1")))
            }
            fn attribute(&self, logical_id: &str, attribute: &str) -> Lookup {
                Lookup::Known(json!(format!("{logical_id}:{attribute}")))
            }
        }

        let definition = build(json!({
            "Resources": {"Bucket": resource("T", json!({
                "Name": {"Fn::Sub": "${Stack::Name}-${Stack::Region}"}
            }))},
            "Outputs": {"Arn": {"Value": {"Fn::GetAtt": "Bucket.Arn"}}}
        }))
        .unwrap();

        let properties = definition.concrete_properties("Bucket", &Created).unwrap();
        assert_eq!(properties["Name"], json!("demo-local-1"));
        let outputs = definition.resolve_outputs(&Created);
        assert_eq!(outputs["Arn"], json!("Bucket:Arn"));
    }

    #[test]
    fn test_empty_definition() {
        let definition = StackDefinition::empty(&context());
        assert!(definition.graph.is_empty());
        assert_eq!(definition.name, "demo");
    }
}
