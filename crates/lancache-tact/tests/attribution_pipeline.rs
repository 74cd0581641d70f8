//! Full metadata-chain test: versions → cdns → configs → install →
//! encoding → archive index → chunk map, served by a local mock CDN.

use lancache_tact::blte::BLTE_MAGIC;
use lancache_tact::{AttributorOptions, BlizzardAttributor, CdnClient};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUILD_CONFIG_HASH: &str = "aaaa1111";
const CDN_CONFIG_HASH: &str = "bbbb2222";
const INSTALL_HASH: &str = "cccc3333";
const ENCODING_HASH: &str = "dddd4444";
const ARCHIVE_HASH: &str = "feedface";

const FILE_CKEY: [u8; 16] = [0xAB; 16];
const FILE_EKEY: [u8; 16] = [0xCD; 16];

fn blte_wrap(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&BLTE_MAGIC);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(b'N');
    out.extend_from_slice(payload);
    out
}

fn install_manifest() -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(b"IN");
    data.push(1); // version
    data.push(16); // hash size
    data.extend_from_slice(&0u16.to_be_bytes()); // tags
    data.extend_from_slice(&1u32.to_be_bytes()); // entries
    data.extend_from_slice(b"wow/data.bin\0");
    data.extend_from_slice(&FILE_CKEY);
    data.extend_from_slice(&0x10u32.to_be_bytes());
    data
}

fn encoding_table() -> Vec<u8> {
    let mut page = Vec::new();
    page.push(1); // key count
    page.extend_from_slice(&0x10u64.to_be_bytes()[3..8]); // 40-bit size
    page.extend_from_slice(&FILE_CKEY);
    page.extend_from_slice(&FILE_EKEY);
    page.resize(1024, 0);

    let mut data = Vec::new();
    data.extend_from_slice(b"EN");
    data.push(1);
    data.push(16);
    data.push(16);
    data.extend_from_slice(&1u16.to_be_bytes()); // ckey page size (KiB)
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&1u32.to_be_bytes()); // ckey pages
    data.extend_from_slice(&0u32.to_be_bytes()); // ekey pages
    data.push(0);
    data.extend_from_slice(&0u32.to_be_bytes()); // empty string block
    data.extend_from_slice(&FILE_CKEY); // page table: first key
    data.extend_from_slice(&md5::compute(&page).0);
    data.extend_from_slice(&page);
    data
}

fn archive_index() -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&FILE_EKEY);
    data.extend_from_slice(&0x10u32.to_be_bytes()); // size
    data.extend_from_slice(&0x1000u32.to_be_bytes()); // offset
    data.resize(4096, 0);

    // footer
    data.extend_from_slice(&[0xAA; 8]); // toc hash
    data.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]); // version
    data.extend_from_slice(&[0, 0, 0]); // unknown
    data.push(4); // block size kb
    data.push(4); // offset bytes
    data.push(4); // size bytes
    data.push(16); // key size
    data.push(8); // checksum size
    data.extend_from_slice(&1u32.to_be_bytes());
    data
}

async fn mount_cdn(server: &MockServer, archives: &str) {
    let text = |body: String| ResponseTemplate::new(200).set_body_string(body);
    let bytes = |body: Vec<u8>| ResponseTemplate::new(200).set_body_bytes(body);

    Mock::given(method("GET"))
        .and(path("/wow/versions"))
        .respond_with(text(format!(
            "Region!STRING:0|BuildConfig!HEX:16|CDNConfig!HEX:16|VersionsName!String:0\n\
             ## seqn = 12345\n\
             us|{BUILD_CONFIG_HASH}|{CDN_CONFIG_HASH}|10.2.5.53040\n"
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/wow/cdns"))
        .respond_with(text(
            "Name!STRING:0|Path!STRING:0|Hosts!STRING:0\n\
             us|tpr/wow|level3.blizzard.com us.cdn.blizzard.com\n"
                .to_string(),
        ))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!(
            "/tpr/wow/config/aa/aa/{BUILD_CONFIG_HASH}"
        )))
        .respond_with(text(format!(
            "# Build Configuration\n\
             install = 0011 {INSTALL_HASH}\n\
             install-size = 40 40\n\
             encoding = 2233 {ENCODING_HASH}\n\
             encoding-size = 1100 1100\n\
             build-name = WOW-53040patch10.2.5\n"
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/tpr/wow/config/bb/bb/{CDN_CONFIG_HASH}")))
        .respond_with(text(format!("archives = {archives}\n")))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/tpr/wow/data/cc/cc/{INSTALL_HASH}")))
        .respond_with(bytes(blte_wrap(&install_manifest())))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/tpr/wow/data/dd/dd/{ENCODING_HASH}")))
        .respond_with(bytes(blte_wrap(&encoding_table())))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/tpr/wow/data/fe/ed/{ARCHIVE_HASH}.index")))
        .respond_with(bytes(archive_index()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn builds_chunk_map_end_to_end() {
    let server = MockServer::start().await;
    mount_cdn(&server, ARCHIVE_HASH).await;

    let client = CdnClient::new()
        .unwrap()
        .with_patch_base(server.uri())
        .with_max_retries(0);
    let attributor = BlizzardAttributor::new(client);

    let options = AttributorOptions {
        host_override: Some(server.uri()),
        ..AttributorOptions::default()
    };
    let map = attributor
        .build_chunk_map("wow", &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(map.file_count(), 1);
    assert_eq!(map.archive_index_of(ARCHIVE_HASH), Some(0));

    let file = map.find_file(0, 0x1000).expect("offset start resolves");
    assert_eq!(file.name, "wow/data.bin");
    assert_eq!(file.size, 0x10);
    assert_eq!(file.content_hash, FILE_CKEY);

    assert!(map.find_file(0, 0x100F).is_some(), "interior offset resolves");
    assert!(map.find_file(0, 0x1010).is_none(), "end offset is exclusive");
    assert!(map.find_file(0, 0x0).is_none());
}

#[tokio::test]
async fn broken_archive_is_skipped_not_fatal() {
    let server = MockServer::start().await;
    // Second archive whose index 404s: the pipeline must still finish.
    mount_cdn(&server, &format!("{ARCHIVE_HASH} 0badc0de")).await;

    let client = CdnClient::new()
        .unwrap()
        .with_patch_base(server.uri())
        .with_max_retries(0);
    let attributor = BlizzardAttributor::new(client);

    let options = AttributorOptions {
        host_override: Some(server.uri()),
        ..AttributorOptions::default()
    };
    let map = attributor
        .build_chunk_map("wow", &options, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(map.file_count(), 1);
}

#[tokio::test]
async fn cancellation_is_terminal() {
    let server = MockServer::start().await;
    mount_cdn(&server, ARCHIVE_HASH).await;

    let client = CdnClient::new()
        .unwrap()
        .with_patch_base(server.uri())
        .with_max_retries(0);
    let attributor = BlizzardAttributor::new(client);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = AttributorOptions {
        host_override: Some(server.uri()),
        ..AttributorOptions::default()
    };
    let err = attributor
        .build_chunk_map("wow", &options, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, lancache_tact::Error::Cancelled));
}
