//! Layout algebra seam
//!
//! The scene graph never interprets sizes or specs itself. An implementation
//! of [`LayoutAlgebra`] decides how an object's overrides combine with what
//! its parent resolved.

/// Combination rules for sizes and layout specs
pub trait LayoutAlgebra: 'static {
    /// A resolved size
    type Size: Clone + 'static;
    /// Per-object size override
    type SizeSpec: Clone + 'static;
    /// A resolved layout spec, as stored in a root's registry
    type Spec: Clone + 'static;
    /// Per-object layout override
    type LayoutSpec: Clone + 'static;

    /// Resolve an object's size from its override and the parent's size
    fn size(spec: &Self::SizeSpec, parent: &Self::Size) -> Self::Size;

    /// Resolve an object's spec from its override, the parent's spec and the
    /// object's resolved size, if one is known
    fn layout(spec: &Self::LayoutSpec, parent: &Self::Spec, size: Option<&Self::Size>) -> Self::Spec;
}
