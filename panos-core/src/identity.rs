//! Identity - Composite identifiers for rule groups
//!
//! The remote system has no notion of a rule group, so everything needed to
//! find one again is packed into a single opaque string:
//!
//! ```text
//! template:template_stack:virtual_router:directive_code:anchor:base64(names)
//! ```
//!
//! Member names are newline-joined and base64 encoded, so they may contain
//! the `:` separator. Scope fields and the anchor may not.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::movement::{DirectiveError, MovementDirective};
use crate::scope::{ID_SEPARATOR, Scope, ScopeError, Target, check_separator};

const FIELD_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("a rule group needs at least one rule")]
    EmptyGroup,

    #[error("rule names must not be empty")]
    EmptyName,

    #[error("rule name {0:?} must not contain a newline")]
    NewlineInName(String),

    #[error("rule {0:?} is listed more than once")]
    DuplicateName(String),

    #[error("position_reference {0:?} is a member of the group")]
    AnchorIsMember(String),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Directive(#[from] DirectiveError),

    #[error("malformed identity {id:?}: {reason}")]
    Malformed { id: String, reason: String },
}

impl IdentityError {
    fn malformed(id: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Durable identifier of one rule group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeIdentity {
    scope: Scope,
    directive: MovementDirective,
    anchor: String,
    names: Vec<String>,
}

impl CompositeIdentity {
    /// Build an identity, checking every invariant the encoding relies on
    pub fn new(
        scope: Scope,
        directive: MovementDirective,
        anchor: impl Into<String>,
        names: Vec<String>,
    ) -> Result<Self, IdentityError> {
        let anchor = anchor.into();

        scope.validate()?;
        directive.validate(&anchor)?;
        check_separator("position_reference", &anchor)?;
        check_names(&names)?;
        if directive.is_relative() && names.contains(&anchor) {
            return Err(IdentityError::AnchorIsMember(anchor));
        }

        Ok(Self {
            scope,
            directive,
            anchor,
            names,
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn directive(&self) -> MovementDirective {
        self.directive
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    /// Member names in declaration order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The member used to locate the group on reads
    pub fn first(&self) -> &str {
        // check_names guarantees at least one member
        &self.names[0]
    }

    pub fn owns(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn encode(&self) -> String {
        let encoded_names = STANDARD.encode(self.names.join("\n"));
        let code = self.directive.code().to_string();

        [
            self.scope.target.template(),
            self.scope.target.template_stack(),
            self.scope.virtual_router.as_str(),
            code.as_str(),
            self.anchor.as_str(),
            encoded_names.as_str(),
        ]
        .join(&ID_SEPARATOR.to_string())
    }

    pub fn decode(id: &str) -> Result<Self, IdentityError> {
        let fields: Vec<&str> = id.split(ID_SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(IdentityError::malformed(
                id,
                format!("expected {} fields, found {}", FIELD_COUNT, fields.len()),
            ));
        }

        let code: u8 = fields[3]
            .parse()
            .map_err(|_| IdentityError::malformed(id, "position code is not a number"))?;
        let directive = MovementDirective::from_code(code)
            .map_err(|e| IdentityError::malformed(id, e.to_string()))?;

        let raw = STANDARD
            .decode(fields[5])
            .map_err(|e| IdentityError::malformed(id, format!("rule list: {}", e)))?;
        let joined = String::from_utf8(raw)
            .map_err(|_| IdentityError::malformed(id, "rule list is not UTF-8"))?;
        let names: Vec<String> = joined.split('\n').map(str::to_string).collect();

        let scope = Scope::new(Target::from_fields(fields[0], fields[1]), fields[2]);

        Self::new(scope, directive, fields[4], names)
            .map_err(|e| IdentityError::malformed(id, e.to_string()))
    }
}

impl fmt::Display for CompositeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for CompositeIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

fn check_names(names: &[String]) -> Result<(), IdentityError> {
    if names.is_empty() {
        return Err(IdentityError::EmptyGroup);
    }

    for (i, name) in names.iter().enumerate() {
        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        if name.contains('\n') {
            return Err(IdentityError::NewlineInName(name.clone()));
        }
        if names[..i].contains(name) {
            return Err(IdentityError::DuplicateName(name.clone()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn panorama_scope() -> Scope {
        Scope::new(Target::panorama("tmplA", ""), "vr1")
    }

    #[test]
    fn round_trip_panorama_after() {
        let id = CompositeIdentity::new(
            panorama_scope(),
            MovementDirective::After,
            "default",
            names(&["rule1", "rule2"]),
        )
        .unwrap();

        let decoded = CompositeIdentity::decode(&id.encode()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn round_trip_across_targets_and_directives() {
        let scopes = [
            Scope::new(Target::Firewall, "default"),
            Scope::new(Target::panorama("", "stack1"), "vr2"),
            Scope::new(Target::panorama("t1", "s1"), "vr3"),
        ];

        for scope in scopes {
            for directive in MovementDirective::ALL {
                let anchor = if directive.is_relative() { "ref" } else { "" };
                let id = CompositeIdentity::new(
                    scope.clone(),
                    directive,
                    anchor,
                    names(&["a", "b:with:colons", "c d"]),
                )
                .unwrap();
                assert_eq!(id.encode().parse::<CompositeIdentity>().unwrap(), id);
            }
        }
    }

    #[test]
    fn encoding_matches_known_layout() {
        let id = CompositeIdentity::new(
            panorama_scope(),
            MovementDirective::After,
            "default",
            names(&["rule1", "rule2"]),
        )
        .unwrap();

        // "rule1\nrule2"
        assert_eq!(id.encode(), "tmplA::vr1:4:default:cnVsZTEKcnVsZTI=");
    }

    #[test]
    fn new_rejects_invalid_groups() {
        let scope = panorama_scope();
        let top = MovementDirective::Top;

        assert_eq!(
            CompositeIdentity::new(scope.clone(), top, "", vec![]),
            Err(IdentityError::EmptyGroup)
        );
        assert_eq!(
            CompositeIdentity::new(scope.clone(), top, "", names(&["a", ""])),
            Err(IdentityError::EmptyName)
        );
        assert!(matches!(
            CompositeIdentity::new(scope.clone(), top, "", names(&["a\nb"])),
            Err(IdentityError::NewlineInName(_))
        ));
        assert_eq!(
            CompositeIdentity::new(scope.clone(), top, "", names(&["a", "b", "a"])),
            Err(IdentityError::DuplicateName("a".to_string()))
        );
        assert!(matches!(
            CompositeIdentity::new(scope.clone(), top, "x", names(&["a"])),
            Err(IdentityError::Directive(DirectiveError::AnchorNotAllowed { .. }))
        ));
        assert_eq!(
            CompositeIdentity::new(scope.clone(), MovementDirective::After, "a", names(&["a"])),
            Err(IdentityError::AnchorIsMember("a".to_string()))
        );
        assert!(matches!(
            CompositeIdentity::new(scope, MovementDirective::Before, "x:y", names(&["a"])),
            Err(IdentityError::Scope(ScopeError::Separator { .. }))
        ));
    }

    #[test]
    fn decode_rejects_wrong_field_count() {
        let err = CompositeIdentity::decode("tmplA::vr1:4:default").unwrap_err();
        assert!(matches!(err, IdentityError::Malformed { .. }));
    }

    #[test]
    fn decode_rejects_bad_code() {
        assert!(matches!(
            CompositeIdentity::decode("tmplA::vr1:x::YQ=="),
            Err(IdentityError::Malformed { .. })
        ));
        assert!(matches!(
            CompositeIdentity::decode("tmplA::vr1:99::YQ=="),
            Err(IdentityError::Malformed { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(matches!(
            CompositeIdentity::decode("tmplA::vr1:1::not*base64"),
            Err(IdentityError::Malformed { .. })
        ));
    }

    #[test]
    fn decode_rejects_empty_rule_list() {
        // An empty payload decodes to a single empty name
        assert!(matches!(
            CompositeIdentity::decode("tmplA::vr1:1::"),
            Err(IdentityError::Malformed { .. })
        ));
    }

    #[test]
    fn decode_rejects_anchor_mismatch() {
        // relative directive without anchor
        assert!(matches!(
            CompositeIdentity::decode("tmplA::vr1:4::YQ=="),
            Err(IdentityError::Malformed { .. })
        ));
    }

    #[test]
    fn first_and_owns() {
        let id = CompositeIdentity::new(
            panorama_scope(),
            MovementDirective::Bottom,
            "",
            names(&["x", "y"]),
        )
        .unwrap();
        assert_eq!(id.first(), "x");
        assert!(id.owns("y"));
        assert!(!id.owns("z"));
    }

    mod property {
        use crate::identity::CompositeIdentity;
        use crate::movement::MovementDirective;
        use crate::scope::{Scope, Target};
        use proptest::prelude::*;

        fn arb_field() -> impl Strategy<Value = String> {
            "[A-Za-z0-9_.-]{0,8}"
        }

        fn arb_scope() -> impl Strategy<Value = Scope> {
            (arb_field(), arb_field(), "[A-Za-z0-9_.-]{1,8}").prop_map(
                |(template, template_stack, virtual_router)| {
                    Scope::new(Target::from_fields(&template, &template_stack), virtual_router)
                },
            )
        }

        fn arb_directive() -> impl Strategy<Value = MovementDirective> {
            prop::sample::select(MovementDirective::ALL.to_vec())
        }

        fn arb_names() -> impl Strategy<Value = Vec<String>> {
            prop::collection::btree_set("[^\n]{1,12}", 1..6)
                .prop_map(|set| set.into_iter().collect())
                .prop_shuffle()
        }

        proptest! {
            #[test]
            fn decode_inverts_encode(
                scope in arb_scope(),
                directive in arb_directive(),
                anchor in "[A-Za-z0-9 _.-]{1,12}",
                names in arb_names(),
            ) {
                let anchor = if directive.is_relative() { anchor } else { String::new() };
                prop_assume!(!names.contains(&anchor));

                let id = CompositeIdentity::new(scope, directive, anchor, names).unwrap();
                prop_assert_eq!(CompositeIdentity::decode(&id.encode()).unwrap(), id);
            }
        }
    }
}
