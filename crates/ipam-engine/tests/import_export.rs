use ipam_core::{Caller, IpamError, OrgId};
use ipam_engine::Ipam;
use ipam_store::{MemoryStore, Store};
use std::net::IpAddr;
use tempfile::TempDir;

const MONACHERS: &str = "Monachers - Matera,
        10.27.1.0/24,
        Monachers,
        org_a,
        ip address,description
        10.27.1.1,Monachers
        10.27.1.254,Nano Beam 5 19AC";

fn org(name: &str) -> Option<OrgId> {
    Some(OrgId::from(name))
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_import_padded_document() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);

    let report = ipam
        .import_document(&caller, org("org_a"), MONACHERS.as_bytes())
        .await
        .unwrap();
    assert!(report.created_subnet);
    assert_eq!(report.subnet.name, "Monachers - Matera");
    assert_eq!(report.subnet.cidr.to_string(), "10.27.1.0/24");
    assert_eq!(report.created, 2);

    let addresses = ipam.addresses(&caller, report.subnet.id).await.unwrap();
    let found: Vec<(IpAddr, Option<&str>)> = addresses
        .iter()
        .map(|a| (a.address, a.description.as_deref()))
        .collect();
    assert_eq!(
        found,
        vec![
            (ip("10.27.1.1"), Some("Monachers")),
            (ip("10.27.1.254"), Some("Nano Beam 5 19AC")),
        ]
    );
}

#[tokio::test]
async fn test_reimport_updates_without_duplicates() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);
    ipam.import_document(&caller, org("org_a"), MONACHERS.as_bytes())
        .await
        .unwrap();

    let changed = MONACHERS.replace("Nano Beam 5 19AC", "Rocket M5");
    let report = ipam
        .import_document(&caller, org("org_a"), changed.as_bytes())
        .await
        .unwrap();
    assert!(!report.created_subnet);
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);

    let addresses = ipam.addresses(&caller, report.subnet.id).await.unwrap();
    assert_eq!(addresses.len(), 2);
    assert_eq!(addresses[1].description.as_deref(), Some("Rocket M5"));
    assert_eq!(ipam.visible_subnets(&caller).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_export_is_byte_exact() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);
    let subnet = ipam
        .create_subnet(&caller, org("org_a"), "10.0.0.0/24", "Sample Subnet")
        .await
        .unwrap();
    ipam.reserve(&caller, subnet.id, ip("10.0.0.2"), Some("Testing".into()))
        .await
        .unwrap();
    ipam.reserve(&caller, subnet.id, ip("10.0.0.1"), Some("Testing".into()))
        .await
        .unwrap();

    let expected: &[u8] = b"Sample Subnet\r\n10.0.0.0/24\r\n\r\nip_address,description\r\n10.0.0.1,Testing\r\n10.0.0.2,Testing\r\n";
    let first = ipam.export_subnet(&caller, subnet.id).await.unwrap();
    assert_eq!(first, expected);
    assert_eq!(ipam.export_subnet(&caller, subnet.id).await.unwrap(), first);
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a", "org_b"]);
    let source = ipam
        .create_subnet(&caller, org("org_a"), "2001:db8:1::/64", "Core, east")
        .await
        .unwrap();
    for (addr, desc) in [("2001:db8:1::1", "router"), ("2001:db8:1::a", ""), ("2001:db8:1::5", "dns, primary")] {
        ipam.reserve(&caller, source.id, ip(addr), Some(desc.into()))
            .await
            .unwrap();
    }

    let exported = ipam.export_subnet(&caller, source.id).await.unwrap();
    let report = ipam
        .import_document(&caller, org("org_b"), &exported)
        .await
        .unwrap();
    assert_eq!(report.subnet.name, "Core, east");
    assert_eq!(report.subnet.cidr, source.cidr);
    assert_eq!(report.created, 3);

    let original: Vec<_> = ipam
        .addresses(&caller, source.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| (a.address, a.description))
        .collect();
    let copied: Vec<_> = ipam
        .addresses(&caller, report.subnet.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| (a.address, a.description))
        .collect();
    assert_eq!(original, copied);
    assert_eq!(
        ipam.export_subnet(&caller, report.subnet.id).await.unwrap(),
        exported
    );
}

#[tokio::test]
async fn test_bad_row_rolls_back_everything() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);
    let doc = b"Lab\n10.1.0.0/24\nip address,description\n10.1.0.1,ok\n10.2.0.1,outside\n";

    let err = ipam
        .import_document(&caller, org("org_a"), doc)
        .await
        .unwrap_err();
    assert!(matches!(err, IpamError::ValidationError(ref msg) if msg.contains("line 5")));
    assert!(ipam.visible_subnets(&caller).await.unwrap().is_empty());
    assert!(ipam.store().subnets(&ipam_store::Scope::All).unwrap().is_empty());
}

#[tokio::test]
async fn test_broadcast_row_is_rejected() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);
    let doc = b"Lab\n10.1.0.0/24\nip address,description\n10.1.0.255,bcast\n";
    assert!(matches!(
        ipam.import_document(&caller, org("org_a"), doc).await,
        Err(IpamError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_malformed_documents() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);

    let docs: [&[u8]; 6] = [
        b"",
        b"Lab\n",
        b"Lab\n10.1.0.0/33\nip address,description\n",
        b"Lab\n10.1.0.0/24\n10.1.0.1,x\n",
        b"Lab\n10.1.0.0/24\nip address,description\nbogus,x\n",
        b"Lab\n10.1.0.0/24\nip address,description\n10.1.0.1,a,b\n",
    ];
    for doc in docs {
        assert!(matches!(
            ipam.import_document(&caller, org("org_a"), doc).await,
            Err(IpamError::ParseError(_))
        ));
    }
}

#[tokio::test]
async fn test_subnet_capturing_reservations_fails_validation() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);
    let existing = ipam
        .create_subnet(&caller, org("org_a"), "10.1.0.0/24", "existing")
        .await
        .unwrap();
    ipam.request_address(&caller, existing.id, None)
        .await
        .unwrap();

    let doc = b"Inner\n10.1.0.0/25\nip address,description\n10.1.0.9,x\n";
    assert!(matches!(
        ipam.import_document(&caller, org("org_a"), doc).await,
        Err(IpamError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_row_owned_by_nested_subnet() {
    let ipam = Ipam::new(MemoryStore::new());
    let caller = Caller::member_of(["org_a"]);
    ipam.create_subnet(&caller, org("org_a"), "10.1.0.0/26", "nested")
        .await
        .unwrap();

    let doc = b"Outer\n10.1.0.0/24\nip address,description\n10.1.0.100,ok\n10.1.0.3,deep\n";
    let err = ipam
        .import_document(&caller, org("org_a"), doc)
        .await
        .unwrap_err();
    assert!(matches!(err, IpamError::ValidationError(ref msg) if msg.contains("10.1.0.0/26")));
    assert_eq!(ipam.visible_subnets(&caller).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_collision_with_shared_subnet() {
    let ipam = Ipam::new(MemoryStore::new());
    let root = Caller::superuser();
    let shared = ipam
        .create_subnet(&root, None, "10.5.0.0/16", "Shared")
        .await
        .unwrap();
    ipam.reserve(&root, shared.id, ip("10.5.0.7"), None)
        .await
        .unwrap();

    let caller = Caller::member_of(["org_a"]);
    let doc = b"Mine\n10.5.0.0/24\nip address,description\n10.5.0.7,clash\n";
    assert!(matches!(
        ipam.import_document(&caller, org("org_a"), doc).await,
        Err(IpamError::ValidationError(_))
    ));

    let doc = b"Mine\n10.5.0.0/24\nip address,description\n10.5.0.8,fine\n";
    ipam.import_document(&caller, org("org_a"), doc)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_import_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ipam.json");
    let caller = Caller::member_of(["org_a"]);

    let subnet_id = {
        let ipam = Ipam::new(MemoryStore::open(&path).unwrap());
        ipam.import_document(&caller, org("org_a"), MONACHERS.as_bytes())
            .await
            .unwrap()
            .subnet
            .id
    };

    let ipam = Ipam::new(MemoryStore::open(&path).unwrap());
    assert_eq!(ipam.addresses(&caller, subnet_id).await.unwrap().len(), 2);
    assert_eq!(
        ipam.next_available(&caller, subnet_id).await.unwrap(),
        ip("10.27.1.2")
    );
}

#[tokio::test]
async fn test_document_organization_decides_access() {
    let ipam = Ipam::new(MemoryStore::new());

    let user_a = Caller::member_of(["org_a"]);
    let report = ipam
        .import_document(&user_a, None, MONACHERS.as_bytes())
        .await
        .unwrap();
    assert_eq!(report.subnet.organization, org("org_a"));

    let user_b = Caller::member_of(["org_b"]);
    assert!(matches!(
        ipam.import_document(&user_b, None, MONACHERS.as_bytes()).await,
        Err(IpamError::Forbidden)
    ));
    assert!(matches!(
        ipam.import_document(&user_b, org("org_b"), MONACHERS.as_bytes())
            .await,
        Err(IpamError::Forbidden)
    ));
    assert!(ipam.visible_subnets(&user_b).await.unwrap().is_empty());

    let root = Caller::superuser();
    let report = ipam
        .import_document(&root, None, MONACHERS.as_bytes())
        .await
        .unwrap();
    assert_eq!(report.subnet.organization, org("org_a"));
    assert!(!report.created_subnet);
    assert_eq!(ipam.visible_subnets(&root).await.unwrap().len(), 1);
}
