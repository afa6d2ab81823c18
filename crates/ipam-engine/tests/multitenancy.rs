use ipam_core::{Caller, IpamError, OrgId, SubnetId};
use ipam_engine::{Ipam, SubnetUpdate};
use ipam_store::MemoryStore;
use std::net::IpAddr;

fn org(name: &str) -> Option<OrgId> {
    Some(OrgId::from(name))
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

struct Fixture {
    ipam: Ipam<MemoryStore>,
    operator_a: Caller,
    operator_b: Caller,
    root: Caller,
    subnet_a: SubnetId,
    subnet_b: SubnetId,
}

async fn fixture() -> Fixture {
    let ipam = Ipam::new(MemoryStore::new());
    let operator_a = Caller::member_of(["org_a"]);
    let operator_b = Caller::member_of(["org_b"]);
    let root = Caller::superuser();

    let subnet_a = ipam
        .create_subnet(&operator_a, org("org_a"), "10.0.0.0/24", "Subnet A")
        .await
        .unwrap()
        .id;
    let subnet_b = ipam
        .create_subnet(&operator_b, org("org_b"), "10.0.1.0/24", "Subnet B")
        .await
        .unwrap()
        .id;

    Fixture {
        ipam,
        operator_a,
        operator_b,
        root,
        subnet_a,
        subnet_b,
    }
}

fn forbidden<T: std::fmt::Debug>(result: Result<T, IpamError>) {
    assert!(
        matches!(result, Err(IpamError::Forbidden)),
        "expected Forbidden, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_subnet_list_is_scoped() {
    let f = fixture().await;

    let seen = f.ipam.visible_subnets(&f.operator_a).await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, "Subnet A");

    let seen = f.ipam.visible_subnets(&f.root).await.unwrap();
    assert_eq!(seen.len(), 2);
}

#[tokio::test]
async fn test_foreign_subnet_is_forbidden_everywhere() {
    let f = fixture().await;
    let (ipam, a, b) = (&f.ipam, &f.operator_a, f.subnet_b);

    forbidden(ipam.subnet(a, b).await);
    forbidden(ipam.children(a, b).await);
    forbidden(ipam.parent(a, b).await);
    forbidden(ipam.next_available(a, b).await);
    forbidden(ipam.request_address(a, b, None).await);
    forbidden(ipam.reserve(a, b, ip("10.0.1.5"), None).await);
    forbidden(ipam.addresses(a, b).await);
    forbidden(ipam.hosts(a, b, 0, 10).await);
    forbidden(ipam.usage(a, b).await);
    forbidden(ipam.export_subnet(a, b).await);
    forbidden(ipam.delete_subnet(a, b, true).await);
    forbidden(ipam.update_subnet(a, b, SubnetUpdate::default()).await);

    assert!(ipam.addresses(&f.operator_b, b).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_and_foreign_look_the_same() {
    let f = fixture().await;
    let missing = SubnetId::new();

    forbidden(f.ipam.subnet(&f.operator_a, missing).await);
    forbidden(f.ipam.request_address(&f.operator_a, missing, None).await);
    assert!(matches!(
        f.ipam.subnet(&f.root, missing).await,
        Err(IpamError::SubnetNotFound(_))
    ));
}

#[tokio::test]
async fn test_foreign_address_is_forbidden() {
    let f = fixture().await;
    let record = f
        .ipam
        .request_address(&f.operator_b, f.subnet_b, Some("printer".into()))
        .await
        .unwrap();

    forbidden(f.ipam.address(&f.operator_a, record.id).await);
    forbidden(
        f.ipam
            .update_description(&f.operator_a, record.id, Some("mine".into()))
            .await,
    );
    forbidden(f.ipam.release_address(&f.operator_a, record.id).await);

    assert_eq!(f.ipam.address(&f.root, record.id).await.unwrap(), record);
}

#[tokio::test]
async fn test_creating_for_foreign_organization_is_forbidden() {
    let f = fixture().await;
    forbidden(
        f.ipam
            .create_subnet(&f.operator_a, org("org_b"), "10.9.0.0/24", "x")
            .await,
    );
    forbidden(
        f.ipam
            .create_address(&f.operator_a, org("org_b"), ip("10.0.1.9"), None)
            .await,
    );
    forbidden(
        f.ipam
            .import_document(
                &f.operator_a,
                org("org_b"),
                b"x\n10.9.0.0/24\nip address,description\n",
            )
            .await,
    );
    forbidden(
        f.ipam
            .resolve_owning_subnet(&f.operator_a, org("org_b").as_ref(), ip("10.0.1.9"))
            .await,
    );
}

#[tokio::test]
async fn test_shared_subnets_belong_to_superusers() {
    let f = fixture().await;
    let shared = f
        .ipam
        .create_subnet(&f.root, None, "192.168.0.0/16", "Shared")
        .await
        .unwrap();

    forbidden(f.ipam.subnet(&f.operator_a, shared.id).await);
    forbidden(f.ipam.create_subnet(&f.operator_a, None, "172.16.0.0/12", "x").await);
    assert_eq!(f.ipam.visible_subnets(&f.root).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_superuser_can_act_for_any_organization() {
    let f = fixture().await;
    let record = f
        .ipam
        .request_address(&f.root, f.subnet_a, None)
        .await
        .unwrap();
    assert_eq!(record.address, ip("10.0.0.1"));

    let next = f
        .ipam
        .next_available(&f.operator_a, f.subnet_a)
        .await
        .unwrap();
    assert_eq!(next, ip("10.0.0.2"));
}
