//! Queries over a [`ModuleView`].
//!
//! Every result is sorted by class name. Names the view does not define are
//! hierarchy boundaries; only strict queries turn them into
//! [`ScanError::UnknownReferenceType`], and then only when the name is not
//! covered by the platform allow-list.

use crate::config::DEFAULT_PLATFORM_PREFIXES;
use crate::container::ScanPolicy;
use crate::error::{ScanError, ScanResult};
use crate::record::{AnnotationUsage, ClassRecord};
use crate::view::ModuleView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Containers whose classes may appear in results.
    pub policies: Vec<ScanPolicy>,
    pub strict: bool,
    /// Package prefixes assumed to be platform types (e.g. `java.`).
    pub platform_allow_list: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            policies: vec![ScanPolicy::Seed, ScanPolicy::Partial],
            strict: false,
            platform_allow_list: DEFAULT_PLATFORM_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl QueryOptions {
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn with_policies(mut self, policies: &[ScanPolicy]) -> Self {
        self.policies = policies.to_vec();
        self
    }

    pub fn all_policies(self) -> Self {
        self.with_policies(&ScanPolicy::ALL)
    }

    pub fn is_platform(&self, name: &str) -> bool {
        self.platform_allow_list
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    fn check_known(&self, view: &ModuleView, name: &str) -> ScanResult<()> {
        if !self.strict || view.contains(name) || self.is_platform(name) {
            return Ok(());
        }
        Err(ScanError::UnknownReferenceType {
            name: name.to_string(),
        })
    }

    fn check_boundaries(&self, view: &ModuleView, class_name: &str) -> ScanResult<()> {
        if !self.strict {
            return Ok(());
        }
        for boundary in view.boundary_types(class_name) {
            self.check_known(view, &boundary)?;
        }
        Ok(())
    }
}

fn candidates<'a>(view: &'a ModuleView, options: &'a QueryOptions) -> impl Iterator<Item = &'a ClassRecord> + 'a {
    view.classes_with_policy(&options.policies)
}

/// Classes annotated with `annotation`, optionally through their ancestry.
pub fn classes_with_annotation(
    view: &ModuleView,
    annotation: &str,
    include_inherited: bool,
    options: &QueryOptions,
) -> ScanResult<Vec<String>> {
    options.check_known(view, annotation)?;
    let mut out = Vec::new();
    for record in candidates(view, options) {
        if include_inherited {
            options.check_boundaries(view, &record.name)?;
        }
        let matched = record.has_class_annotation(annotation)
            || (include_inherited && view.inherited_annotations(&record.name).contains(annotation));
        if matched {
            out.push(record.name.clone());
        }
    }
    Ok(out)
}

/// `type_name` itself, if selected, plus every selected class having it
/// among its transitive superclasses or interfaces.
pub fn classes_assignable_to(
    view: &ModuleView,
    type_name: &str,
    options: &QueryOptions,
) -> ScanResult<Vec<String>> {
    options.check_known(view, type_name)?;
    let mut out = Vec::new();
    for record in candidates(view, options) {
        options.check_boundaries(view, &record.name)?;
        if record.name == type_name || view.supertypes(&record.name).contains(type_name) {
            out.push(record.name.clone());
        }
    }
    Ok(out)
}

/// Classes whose package is `package` or a subpackage of it. Matching is by
/// whole package segments, so `com.acme` does not match `com.acmetools`.
/// An empty prefix selects every class.
pub fn classes_in_package(view: &ModuleView, package: &str, options: &QueryOptions) -> Vec<String> {
    let package = package.trim_end_matches('.');
    candidates(view, options)
        .filter(|record| {
            let pkg = record.package();
            package.is_empty()
                || pkg == package
                || pkg
                    .strip_prefix(package)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
        .map(|record| record.name.clone())
        .collect()
}

/// Classes declaring a field annotated with `annotation`.
pub fn classes_with_field_annotation(
    view: &ModuleView,
    annotation: &str,
    options: &QueryOptions,
) -> ScanResult<Vec<String>> {
    options.check_known(view, annotation)?;
    Ok(candidates(view, options)
        .filter(|record| record.has_field_annotation(annotation))
        .map(|record| record.name.clone())
        .collect())
}

/// Classes declaring a method, or a method parameter, annotated with
/// `annotation`.
pub fn classes_with_method_annotation(
    view: &ModuleView,
    annotation: &str,
    options: &QueryOptions,
) -> ScanResult<Vec<String>> {
    options.check_known(view, annotation)?;
    Ok(candidates(view, options)
        .filter(|record| record.has_method_annotation(annotation))
        .map(|record| record.name.clone())
        .collect())
}

/// Direct class-level annotations of the winning definition of `class_name`.
/// Undefined classes yield nothing unless the query is strict.
pub fn annotations_on(
    view: &ModuleView,
    class_name: &str,
    options: &QueryOptions,
) -> ScanResult<Vec<AnnotationUsage>> {
    options.check_known(view, class_name)?;
    Ok(view
        .class(class_name)
        .map(|record| record.class_annotations.clone())
        .unwrap_or_default())
}
