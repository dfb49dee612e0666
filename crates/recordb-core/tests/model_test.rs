//! Model-level properties of records, schemas, predicates and ACLs
//!
//! These tests need no database.

use recordb_core::prelude::*;
use serde_json::json;

fn users() -> Vec<Option<UserInfo>> {
    vec![
        None,
        Some(UserInfo::new("alice")),
        Some(UserInfo::new("bob").with_roles(["admin"])),
    ]
}

// ============================================================================
// Record ACL
// ============================================================================

#[test]
fn empty_acl_grants_everything() {
    let acl = RecordAcl::default();
    for user in users() {
        assert!(acl.accessible(user.as_ref(), AclLevel::Read));
        assert!(acl.accessible(user.as_ref(), AclLevel::Write));
    }
}

#[test]
fn anonymous_read_iff_public_entry() {
    let without_public = RecordAcl::new(vec![
        RecordAclEntry::role("admin", AclLevel::Write),
        RecordAclEntry::direct("alice", AclLevel::Read),
    ]);
    assert!(!without_public.accessible(None, AclLevel::Read));

    for level in [AclLevel::Read, AclLevel::Write] {
        let with_public = RecordAcl::new(vec![
            RecordAclEntry::role("admin", AclLevel::Write),
            RecordAclEntry::public(level),
        ]);
        assert!(with_public.accessible(None, AclLevel::Read));
    }
}

// Read is satisfied by any matching entry even when it only grants read;
// write needs an entry at write level. Existing data depends on this.
#[test]
fn read_write_asymmetry_is_preserved() {
    let acl = RecordAcl::new(vec![RecordAclEntry::role("admin", AclLevel::Read)]);
    let bob = UserInfo::new("bob").with_roles(["admin"]);
    assert!(acl.accessible(Some(&bob), AclLevel::Read));
    assert!(!acl.accessible(Some(&bob), AclLevel::Write));
    assert!(!acl.accessible(Some(&bob), AclLevel::Create));
}

#[test]
fn acl_json_round_trip() {
    let raw = json!([
        {"relation": "$direct", "level": "write", "user_id": "alice"},
        {"role": "admin", "level": "read"},
        {"level": "read", "public": true}
    ]);
    let acl: RecordAcl = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(acl.entries().len(), 3);
    assert_eq!(serde_json::to_value(&acl).unwrap(), raw);
}

// ============================================================================
// Field ACL
// ============================================================================

#[test]
fn field_acl_wildcard_type_wins() {
    let acl = FieldAcl::new(vec![
        FieldAclEntry {
            writable: false,
            ..FieldAclEntry::allow_all("*", "price", FieldUserRole::AnyUser)
        },
        FieldAclEntry::allow_all("product", "price", FieldUserRole::AnyUser),
    ]);
    let alice = UserInfo::new("alice");
    assert!(!acl.accessible(Some(&alice), None, "product", "price", FieldAccessMode::Write));
    assert!(acl.accessible(Some(&alice), None, "product", "price", FieldAccessMode::Read));
}

#[test]
fn field_acl_default_applies_last() {
    let config = StoreConfig::default().with_default_field_access(DefaultFieldAccess {
        readable: true,
        writable: false,
        comparable: false,
        discoverable: false,
    });
    let acl = FieldAcl::with_default(
        vec![FieldAclEntry::allow_all("note", "body", FieldUserRole::Owner)],
        config.default_field_access.to_entry(),
    );
    let note = Record::new(RecordId::new("note", "1")).with_owner("alice");
    let alice = UserInfo::new("alice");
    let bob = UserInfo::new("bob");

    assert!(acl.accessible(Some(&alice), Some(&note), "note", "body", FieldAccessMode::Write));
    assert!(!acl.accessible(Some(&bob), Some(&note), "note", "body", FieldAccessMode::Write));
    assert!(acl.accessible(Some(&bob), Some(&note), "note", "body", FieldAccessMode::Read));
}

// ============================================================================
// Schema compatibility
// ============================================================================

#[test]
fn schema_compatibility_is_directional() {
    let b = RecordSchema::new()
        .with_field("content", FieldType::new(DataType::String))
        .with_field("city", FieldType::reference("city"));
    let a = b
        .clone()
        .with_field("order", FieldType::new(DataType::Number))
        .with_field("area", FieldType::new(DataType::Geometry));

    assert!(a.definition_compatible_to(&b));
    assert!(!b.definition_compatible_to(&a));
    assert!(a.definition_compatible_to(&a.clone()));
}

#[test]
fn schema_rejects_changed_reference_target() {
    let have = RecordSchema::new().with_field("city", FieldType::reference("city"));
    let want = RecordSchema::new().with_field("city", FieldType::reference("town"));
    assert!(!have.definition_compatible_to(&want));
}

// ============================================================================
// Predicate validation
// ============================================================================

#[test]
fn binary_operator_arity() {
    for operator in [Operator::Equal, Operator::LessThan, Operator::Like, Operator::In] {
        let one = Predicate::new(operator, vec![Expression::key_path("a").into()]);
        assert!(one.validate().is_err(), "{} with one child", operator);

        let three = Predicate::new(
            operator,
            vec![
                Expression::key_path("a").into(),
                Expression::literal(1).into(),
                Expression::literal(2).into(),
            ],
        );
        assert!(three.validate().is_err(), "{} with three children", operator);
    }
}

#[test]
fn equal_with_collection_literal_is_rejected() {
    for literal in [json!([1, 2]), json!({"k": "v"})] {
        let p = Predicate::equal(Expression::key_path("tags"), Expression::Literal(Value::Json(literal)));
        assert!(p.validate().is_err());
    }
}

#[test]
fn nested_user_discover_is_rejected() {
    let discover = Predicate::functional(Func::UserDiscover {
        usernames: vec!["alice".into()],
        emails: vec![],
    });
    let q = Query::new("user").with_predicate(Predicate::not(discover));
    assert!(matches!(
        q.validate(),
        Err(Error::RecordQueryInvalid { .. })
    ));
}

#[test]
fn predicate_json_round_trip() {
    let p = Predicate::and(vec![
        Predicate::equal(Expression::key_path("category"), Expression::literal("work")),
        Predicate::compare(
            Operator::LessThan,
            Expression::Function(Func::Distance {
                field: "location".into(),
                location: Location::new(114.1, 22.3),
            }),
            Expression::literal(500.0),
        ),
    ]);
    let query = Query::new("note").with_predicate(p);
    let json = serde_json::to_value(&query).unwrap();
    assert_eq!(json["Type"], "note");
    let back: Query = serde_json::from_value(json).unwrap();
    assert_eq!(back, query);
}

// ============================================================================
// Matcher
// ============================================================================

#[test]
fn matcher_evaluates_subscription_queries() {
    let record = Record::new(RecordId::new("note", "n1"))
        .with_owner("alice")
        .with_field("category", "work")
        .with_field("priority", 3);

    let query = Predicate::and(vec![
        Predicate::equal(Expression::key_path("category"), Expression::literal("work")),
        Predicate::compare(
            Operator::In,
            Expression::key_path("priority"),
            Expression::Literal(Value::Json(json!([1, 2, 3]))),
        ),
    ]);
    assert!(matches(Some(&query), &record).unwrap());

    let other = Predicate::equal(Expression::key_path("category"), Expression::literal("home"));
    assert!(!matches(Some(&other), &record).unwrap());
    assert!(matches(None, &record).unwrap());
}

#[test]
fn matcher_rejects_ordering_operators() {
    let record = Record::new(RecordId::new("note", "n1")).with_field("priority", 3);
    let p = Predicate::compare(
        Operator::LessThanOrEqual,
        Expression::key_path("priority"),
        Expression::literal(5),
    );
    assert!(matches(Some(&p), &record).is_err());
}
