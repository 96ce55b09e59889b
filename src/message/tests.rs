use serde::{Deserialize, Serialize};

use super::{AnyMessage, Message, MessageCodec, MessageRegistry};
use crate::tests::fixtures::{
    BanMessage, Echo, MapReload, PardonMessage, Punishment, SecurityEvent, ban, registry,
};
use crate::utils::error::{CodecError, RegistryError};

#[test]
fn test_routable_types_start_with_self_then_ancestors() {
    let registry = registry();
    assert_eq!(
        registry.routable_types(BanMessage::TAG),
        &[BanMessage::TAG, Punishment::TAG, SecurityEvent::TAG]
    );
    assert_eq!(registry.routable_types(MapReload::TAG), &[MapReload::TAG]);
    assert!(registry.routable_types("tidings.test.Missing").is_empty());
}

#[test]
fn test_is_subtype_follows_declared_hierarchy() {
    let registry = registry();
    assert!(registry.is_subtype(BanMessage::TAG, BanMessage::TAG));
    assert!(registry.is_subtype(BanMessage::TAG, Punishment::TAG));
    assert!(registry.is_subtype(PardonMessage::TAG, SecurityEvent::TAG));
    assert!(!registry.is_subtype(Punishment::TAG, BanMessage::TAG));
    assert!(!registry.is_subtype(MapReload::TAG, Punishment::TAG));
}

#[test]
fn test_upcast_converts_into_ancestors() {
    let registry = registry();
    let message = AnyMessage::new(ban("1.2.3.4"));

    assert_eq!(registry.upcast::<BanMessage>(&message), Some(ban("1.2.3.4")));
    assert_eq!(
        registry.upcast::<Punishment>(&message),
        Some(Punishment::Ban(ban("1.2.3.4")))
    );
    assert_eq!(
        registry.upcast::<SecurityEvent>(&message),
        Some(SecurityEvent::Punishment(Punishment::Ban(ban("1.2.3.4"))))
    );
    assert_eq!(registry.upcast::<MapReload>(&message), None);
}

#[test]
fn test_resolve_returns_registered_tag() {
    let registry = registry();
    let owned = String::from("tidings.test.Echo");
    assert_eq!(registry.resolve(&owned), Some(Echo::TAG));
    assert_eq!(registry.resolve("tidings.test.Nope"), None);
    assert_eq!(registry.len(), 6);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chicken;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Egg;

impl Message for Chicken {
    const TAG: &'static str = "tidings.test.Chicken";
}

impl Message for Egg {
    const TAG: &'static str = "tidings.test.Egg";
}

impl From<Chicken> for Egg {
    fn from(_: Chicken) -> Self {
        Egg
    }
}

impl From<Egg> for Chicken {
    fn from(_: Egg) -> Self {
        Chicken
    }
}

#[test]
fn test_cyclic_hierarchy_is_rejected() {
    let result = MessageRegistry::builder()
        .register_subtype::<Chicken, Egg>()
        .register_subtype::<Egg, Chicken>()
        .build();
    assert!(matches!(result, Err(RegistryError::Cycle(_))));
}

#[test]
fn test_codec_decodes_what_it_encodes() {
    let codec = MessageCodec::new(registry());
    let payload = codec.encode(&AnyMessage::new(ban("10.0.0.1"))).unwrap();

    let decoded = codec.decode(BanMessage::TAG, &payload).unwrap();
    assert_eq!(decoded.tag(), BanMessage::TAG);
    assert_eq!(decoded.downcast_ref::<BanMessage>(), Some(&ban("10.0.0.1")));
}

#[test]
fn test_codec_rejects_unregistered_type_on_encode() {
    let codec = MessageCodec::new(registry());
    let err = codec.encode(&AnyMessage::new(Chicken)).unwrap_err();
    assert!(matches!(err, CodecError::Unregistered(tag) if tag == Chicken::TAG));
}

#[test]
fn test_codec_decode_failures() {
    let codec = MessageCodec::new(registry()).with_max_payload_size(32);

    let unknown = codec.decode("tidings.test.Gone", b"{}").unwrap_err();
    assert!(unknown.is_unknown_type());

    assert!(matches!(
        codec.decode(BanMessage::TAG, b""),
        Err(CodecError::Empty)
    ));

    let big = vec![b' '; 33];
    assert!(matches!(
        codec.decode(BanMessage::TAG, &big),
        Err(CodecError::TooLarge { size: 33, max: 32 })
    ));

    let malformed = codec.decode(BanMessage::TAG, b"{\"nope\":").unwrap_err();
    assert!(matches!(malformed, CodecError::Malformed { .. }));
    assert!(!malformed.is_unknown_type());
}

#[test]
fn test_codec_caps_size_on_decode_only() {
    let codec = MessageCodec::new(registry()).with_max_payload_size(16);
    let bytes = codec
        .encode(&AnyMessage::new(ban("a-very-long-target-name")))
        .unwrap();
    assert!(bytes.len() > 16);

    let err = codec.decode(BanMessage::TAG, &bytes).unwrap_err();
    assert!(matches!(err, CodecError::TooLarge { max: 16, .. }));
}
