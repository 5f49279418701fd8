use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Data-free description of the refs a component declares.
///
/// Both sides build their ref trees from the same shape, so slot names map to
/// the same coordinates on each side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefShape {
    pub slots: Vec<RefSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RefSlot {
    /// A single element
    Element { name: String },
    /// One element per list key
    Repeated { name: String },
    /// A nested component
    Component { name: String, shape: Arc<RefShape> },
    /// One nested component per list key
    ComponentList { name: String, shape: Arc<RefShape> },
}

impl RefSlot {
    pub fn name(&self) -> &str {
        match self {
            RefSlot::Element { name }
            | RefSlot::Repeated { name }
            | RefSlot::Component { name, .. }
            | RefSlot::ComponentList { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RefSlot::Element { .. } => "element",
            RefSlot::Repeated { .. } => "repeated",
            RefSlot::Component { .. } => "component",
            RefSlot::ComponentList { .. } => "component-list",
        }
    }
}

impl RefShape {
    pub fn builder() -> RefShapeBuilder {
        RefShapeBuilder::default()
    }

    pub fn slot(&self, name: &str) -> Option<&RefSlot> {
        self.slots.iter().find(|slot| slot.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RefShapeBuilder {
    slots: Vec<RefSlot>,
}

impl RefShapeBuilder {
    pub fn element(mut self, name: impl Into<String>) -> Self {
        self.slots.push(RefSlot::Element { name: name.into() });
        self
    }

    pub fn repeated(mut self, name: impl Into<String>) -> Self {
        self.slots.push(RefSlot::Repeated { name: name.into() });
        self
    }

    pub fn component(mut self, name: impl Into<String>, shape: RefShape) -> Self {
        self.slots.push(RefSlot::Component {
            name: name.into(),
            shape: Arc::new(shape),
        });
        self
    }

    pub fn component_list(mut self, name: impl Into<String>, shape: RefShape) -> Self {
        self.slots.push(RefSlot::ComponentList {
            name: name.into(),
            shape: Arc::new(shape),
        });
        self
    }

    pub fn build(self) -> RefShape {
        RefShape { slots: self.slots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_wire_form() {
        let shape = RefShape::builder()
            .element("increment")
            .component_list("rows", RefShape::builder().element("remove").build())
            .build();
        let wire = serde_json::to_value(&shape).unwrap();
        assert_eq!(
            wire,
            json!({"slots": [
                {"kind": "element", "name": "increment"},
                {"kind": "component-list", "name": "rows", "shape": {"slots": [
                    {"kind": "element", "name": "remove"}
                ]}}
            ]})
        );
        let back: RefShape = serde_json::from_value(wire).unwrap();
        assert_eq!(back, shape);
        assert_eq!(back.slot("rows").map(RefSlot::kind), Some("component-list"));
        assert!(back.slot("missing").is_none());
    }
}
