//! In-band account registration (XEP-0077).

mod common;

use common::{establish_bound_session, RawXmppClient, TestServer};

#[tokio::test]
async fn pre_auth_registration_creates_account() {
    let server = TestServer::start().await;

    let mut client = RawXmppClient::connect(server.addr).await;
    let features = client.open_stream().await;
    assert!(
        features.contains("http://jabber.org/features/iq-register"),
        "got: {}",
        features
    );

    client
        .send(
            "<iq type='set' id='reg-1'><query xmlns='jabber:iq:register'>\
             <username>carol</username><password>pw</password></query></iq>",
        )
        .await;
    let reply = client.read_until("</iq>").await;
    assert!(reply.contains("type='result'"), "got: {}", reply);
    assert!(reply.contains("id='reg-1'"), "got: {}", reply);
    assert!(xmppd::user::user_exists(&server.datadir, "carol"));

    // The same registration again conflicts.
    client
        .send(
            "<iq type='set' id='reg-2'><query xmlns='jabber:iq:register'>\
             <username>carol</username><password>pw</password></query></iq>",
        )
        .await;
    let reply = client.read_until("</iq>").await;
    assert!(reply.contains("<conflict"), "got: {}", reply);

    // The fresh account can authenticate.
    let mut carol = RawXmppClient::connect(server.addr).await;
    establish_bound_session(&mut carol, "carol", "pw", "web").await;
}

#[tokio::test]
async fn bad_username_is_not_acceptable() {
    let server = TestServer::start().await;

    let mut client = RawXmppClient::connect(server.addr).await;
    client.open_stream().await;
    client
        .send(
            "<iq type='set' id='reg-1'><query xmlns='jabber:iq:register'>\
             <username>no spaces allowed</username><password>pw</password></query></iq>",
        )
        .await;
    let reply = client.read_until("</iq>").await;
    assert!(reply.contains("<not-acceptable"), "got: {}", reply);
}

#[tokio::test]
async fn registration_form_is_served_pre_auth() {
    let server = TestServer::start().await;

    let mut client = RawXmppClient::connect(server.addr).await;
    client.open_stream().await;
    client
        .send("<iq type='get' id='form-1'><query xmlns='jabber:iq:register'/></iq>")
        .await;
    let reply = client.read_until("</iq>").await;
    assert!(reply.contains("<username"), "got: {}", reply);
    assert!(reply.contains("<password"), "got: {}", reply);
    assert!(reply.contains("<instructions"), "got: {}", reply);
}

#[tokio::test]
async fn password_change_requires_matching_username() {
    let server = TestServer::start().await;
    server.add_user("alice", "old-pw");
    server.add_user("mallory", "pw-m");

    let mut mallory = RawXmppClient::connect(server.addr).await;
    establish_bound_session(&mut mallory, "mallory", "pw-m", "x").await;
    mallory
        .send(
            "<iq type='set' id='chg-1'><query xmlns='jabber:iq:register'>\
             <username>alice</username><password>stolen</password></query></iq>",
        )
        .await;
    let reply = mallory.read_until("</iq>").await;
    assert!(reply.contains("<not-allowed"), "got: {}", reply);
    assert!(xmppd::user::check_password(&server.datadir, "alice", "old-pw"));
}

#[tokio::test]
async fn account_removal_tears_session_down() {
    let server = TestServer::start().await;
    server.add_user("alice", "pw");

    let mut alice = RawXmppClient::connect(server.addr).await;
    establish_bound_session(&mut alice, "alice", "pw", "home").await;
    alice
        .send(
            "<iq type='set' id='rm-1'><query xmlns='jabber:iq:register'>\
             <remove/></query></iq>",
        )
        .await;
    let reply = alice.read_until("</iq>").await;
    assert!(reply.contains("type='result'"), "got: {}", reply);
    alice.read_eof().await;
    assert!(!xmppd::user::user_exists(&server.datadir, "alice"));
}
