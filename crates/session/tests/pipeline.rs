//! Optimistisches Echo, Bestaetigungen, Klartext-Cache und Ereignisschleife

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, Geraet, TestServer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tresor_core::{MessageId, UserId};
use tresor_keystore::{KeyStore, SqliteKeyStore};
use tresor_protocol::Destination;
use tresor_session::{
    Client, ClientAusgabe, DecryptResult, SessionError, Transport, TransportEvent,
};

#[tokio::test]
async fn bestaetigung_ordnet_server_id_zu() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;

    let erste = alice
        .client
        .encrypt_outgoing(Destination::user(bob.account), "eins", None)
        .await
        .unwrap();
    let zweite = alice
        .client
        .encrypt_outgoing(Destination::user(bob.account), "zwei", None)
        .await
        .unwrap();
    assert_eq!(alice.client.pipeline().offene_bestaetigungen(), 2);

    let ids = server.bestaetigungen(alice.account).await;
    assert_eq!(ids.len(), 2);

    let r1 = alice.client.acknowledge(ids[0]).await.unwrap();
    let r2 = alice.client.acknowledge(ids[1]).await.unwrap();
    assert_eq!(r1.correlation_id, erste.correlation_id);
    assert_eq!(r2.correlation_id, zweite.correlation_id);
    assert_eq!(r2.server_id, ids[1]);
    assert_eq!(alice.client.pipeline().offene_bestaetigungen(), 0);

    // Eigene Nachricht kommt (z.B. aus dem Verlauf) zurueck
    let echo = erste.envelope.clone().with_message_id(ids[0]);
    assert_eq!(
        alice.client.decrypt_incoming(&echo).await.unwrap(),
        DecryptResult::CacheHit("eins".into())
    );
}

#[tokio::test]
async fn unerwartete_bestaetigung() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let id = MessageId::new();
    assert!(matches!(
        alice.client.acknowledge(id).await,
        Err(SessionError::UnexpectedAcknowledgement(fremd)) if fremd == id
    ));
}

#[tokio::test]
async fn eigene_nachricht_ohne_cache_ist_nicht_lesbar() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;

    let ausgehend = alice
        .client
        .encrypt_outgoing(Destination::user(bob.account), "nie bestaetigt", None)
        .await
        .unwrap();
    let echo = ausgehend.envelope.with_message_id(MessageId::new());
    assert!(matches!(
        alice.client.decrypt_incoming(&echo).await.unwrap(),
        DecryptResult::Undecryptable { .. }
    ));
}

#[tokio::test]
async fn fehlgeschlagene_zustellung_entfernt_provisorium() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;

    // Sitzung aufbauen, damit nur die Zustellung scheitert
    alice
        .client
        .establisher()
        .ensure_session(bob.account)
        .await
        .unwrap();
    server.zustellung_fehlschlagen(true).await;
    let ergebnis = alice
        .client
        .encrypt_outgoing(Destination::user(bob.account), "verloren", None)
        .await;
    assert!(matches!(ergebnis, Err(SessionError::Transport(_))));
    assert_eq!(alice.client.pipeline().offene_bestaetigungen(), 0);
}

#[tokio::test]
async fn dedup_liefert_cache_treffer() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;

    alice
        .client
        .encrypt_outgoing(Destination::user(bob.account), "doppelt", Some(MessageId::new()))
        .await
        .unwrap();
    let envelope = server.abholen(bob.account).await.remove(0);
    assert!(envelope.reply_to.is_some());

    assert_eq!(
        bob.client.decrypt_incoming(&envelope).await.unwrap(),
        DecryptResult::Decrypted("doppelt".into())
    );
    assert_eq!(
        bob.client.decrypt_incoming(&envelope).await.unwrap(),
        DecryptResult::CacheHit("doppelt".into())
    );
    assert_eq!(bob.client.pipeline().klartext_anzahl(), 1);
}

#[tokio::test]
async fn klartext_cache_ueberlebt_neustart_und_ist_begrenzt() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;

    let mut config = test_config();
    config.pipeline.klartext_cache = 3;
    let bob_klein = Client::neu(
        bob.account,
        config.clone(),
        Arc::clone(&bob.store) as Arc<dyn KeyStore>,
        Arc::clone(&server) as Arc<dyn Transport>,
    )
    .await
    .unwrap();
    bob_klein.bootstrap().await.unwrap();

    for i in 0..5 {
        alice
            .client
            .encrypt_outgoing(Destination::user(bob.account), &format!("nr {i}"), None)
            .await
            .unwrap();
    }
    let eingang = server.abholen(bob.account).await;
    for envelope in &eingang {
        assert!(matches!(
            bob_klein.decrypt_incoming(envelope).await.unwrap(),
            DecryptResult::Decrypted(_)
        ));
    }
    assert_eq!(bob_klein.pipeline().klartext_anzahl(), 3);

    // Neustart: Dedup ist leer, der Cache liegt im KeyStore
    let neu_gestartet = Client::neu(
        bob.account,
        config,
        Arc::clone(&bob.store) as Arc<dyn KeyStore>,
        Arc::clone(&server) as Arc<dyn Transport>,
    )
    .await
    .unwrap();
    neu_gestartet.bootstrap().await.unwrap();
    assert_eq!(neu_gestartet.pipeline().klartext_anzahl(), 3);

    assert_eq!(
        neu_gestartet.decrypt_incoming(&eingang[4]).await.unwrap(),
        DecryptResult::CacheHit("nr 4".into())
    );
    // Verdraengt und nicht mehr entschluesselbar (Ratchet ist weiter)
    assert!(matches!(
        neu_gestartet.decrypt_incoming(&eingang[0]).await,
        Err(SessionError::Duplicate)
    ));
}

#[tokio::test]
async fn ereignisschleife_verteilt_ereignisse() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;

    let (eingang_tx, eingang_rx) = mpsc::channel(16);
    let (ausgang_tx, mut ausgang_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let schleife = tokio::spawn(Arc::clone(&bob.client).run_event_loop(
        eingang_rx,
        ausgang_tx,
        cancel.clone(),
    ));

    alice
        .client
        .encrypt_outgoing(Destination::user(bob.account), "ueber die Schleife", None)
        .await
        .unwrap();
    for envelope in server.abholen(bob.account).await {
        eingang_tx.send(TransportEvent::Envelope(envelope)).await.unwrap();
    }
    match ausgang_rx.recv().await.unwrap() {
        ClientAusgabe::Nachricht { ergebnis, .. } => {
            assert_eq!(ergebnis, DecryptResult::Decrypted("ueber die Schleife".into()));
        }
        anderes => panic!("Nachricht erwartet: {anderes:?}"),
    }

    // Fehler beenden die Schleife nicht
    eingang_tx
        .send(TransportEvent::Bestaetigung(MessageId::new()))
        .await
        .unwrap();
    assert!(matches!(
        ausgang_rx.recv().await.unwrap(),
        ClientAusgabe::Fehler { ereignis: "bestaetigung", .. }
    ));

    bob.client
        .encrypt_outgoing(Destination::user(alice.account), "Antwort", None)
        .await
        .unwrap();
    let id = server.bestaetigungen(bob.account).await.remove(0);
    eingang_tx.send(TransportEvent::Bestaetigung(id)).await.unwrap();
    assert!(matches!(
        ausgang_rx.recv().await.unwrap(),
        ClientAusgabe::Bestaetigt(r) if r.server_id == id
    ));

    cancel.cancel();
    schleife.await.unwrap();
}

#[tokio::test]
async fn sitzungen_ueber_sqlite() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;

    let bob_id = UserId::new();
    let store: Arc<dyn KeyStore> = Arc::new(SqliteKeyStore::in_memory().await.unwrap());
    let bob = Client::neu(
        bob_id,
        test_config(),
        store,
        Arc::clone(&server) as Arc<dyn Transport>,
    )
    .await
    .unwrap();
    bob.bootstrap().await.unwrap();

    alice
        .client
        .encrypt_outgoing(Destination::user(bob_id), "persistiert", None)
        .await
        .unwrap();
    let envelope = server.abholen(bob_id).await.remove(0);
    assert_eq!(
        bob.decrypt_incoming(&envelope).await.unwrap(),
        DecryptResult::Decrypted("persistiert".into())
    );
    assert_eq!(bob.lifecycle().one_time_pre_keys_lokal().await.unwrap(), 4);
}

#[tokio::test]
async fn registrierung_loest_arbeitsnachweis() {
    let server = TestServer::neu();
    let geraet = Geraet::neu(&server).await;
    let handle = geraet.client.start_registration(b"server-challenge".to_vec(), 6);
    let proof = handle.ergebnis().await.unwrap();
    assert!(tresor_crypto::ProofOfWorkGate::verify(
        &proof.challenge,
        proof.nonce,
        proof.difficulty
    ));
}

#[tokio::test]
async fn haengender_bundle_abruf_haelt_andere_sendungen_nicht_auf() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let carol = Geraet::bereit(&server).await;

    server.bundle_anhalten(carol.account).await;
    let an_carol = alice
        .client
        .encrypt_outgoing(Destination::user(carol.account), "an Carol", None);
    let an_bob = async {
        let ergebnis = tokio::time::timeout(
            Duration::from_secs(5),
            alice
                .client
                .encrypt_outgoing(Destination::user(bob.account), "an Bob", None),
        )
        .await;
        server.bundle_freigeben(carol.account).await;
        ergebnis
    };
    let (an_carol, an_bob) = tokio::join!(an_carol, an_bob);

    let an_bob = an_bob.expect("Sendung an Bob wartete auf Carols Bundle").unwrap();
    let an_carol = an_carol.unwrap();

    // Zustellreihenfolge und Bestaetigungen bleiben deckungsgleich
    let ids = server.bestaetigungen(alice.account).await;
    assert_eq!(ids.len(), 2);
    let erste = alice.client.acknowledge(ids[0]).await.unwrap();
    let zweite = alice.client.acknowledge(ids[1]).await.unwrap();
    assert_eq!(erste.correlation_id, an_bob.correlation_id);
    assert_eq!(zweite.correlation_id, an_carol.correlation_id);

    let eingang = server.abholen(carol.account).await.remove(0);
    assert_eq!(
        carol.client.decrypt_incoming(&eingang).await.unwrap(),
        DecryptResult::Decrypted("an Carol".into())
    );
}
