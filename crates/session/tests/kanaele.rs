//! Kanalnachrichten ueber Sender-Keys

mod common;

use std::sync::Arc;

use common::{Geraet, TestServer};
use tresor_core::{ChannelId, SchluesselEreignis, ServerId};
use tresor_crypto::SenderKeyMessage;
use tresor_keystore::MemoryKeyStore;
use tresor_protocol::{Destination, Envelope, EnvelopeKind};
use tresor_session::{DecryptResult, SessionError};

struct Kanal {
    server_id: ServerId,
    channel_id: ChannelId,
}

impl Kanal {
    fn ziel(&self) -> Destination {
        Destination::channel(self.server_id, self.channel_id)
    }
}

async fn kanal(server: &TestServer, mitglieder: &[&Geraet]) -> Kanal {
    let kanal = Kanal {
        server_id: ServerId::new(),
        channel_id: ChannelId::new(),
    };
    server
        .mitglieder_setzen(kanal.channel_id, mitglieder.iter().map(|g| g.account).collect())
        .await;
    kanal
}

/// Verarbeitet das ganze Postfach und gibt die Ergebnisse zurueck
async fn alles_lesen(server: &TestServer, geraet: &Geraet) -> Vec<(Envelope, DecryptResult)> {
    let mut ergebnisse = Vec::new();
    for envelope in server.abholen(geraet.account).await {
        let ergebnis = geraet.client.decrypt_incoming(&envelope).await.unwrap();
        ergebnisse.push((envelope, ergebnis));
    }
    ergebnisse
}

fn texte(ergebnisse: &[(Envelope, DecryptResult)]) -> Vec<String> {
    ergebnisse
        .iter()
        .filter_map(|(_, e)| match e {
            DecryptResult::Decrypted(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn kanalnachricht_erreicht_alle_mitglieder() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let carol = Geraet::bereit(&server).await;
    let kanal = kanal(&server, &[&alice, &bob, &carol]).await;

    let ausgehend = alice
        .client
        .encrypt_outgoing(kanal.ziel(), "Hallo zusammen", None)
        .await
        .unwrap();
    assert_eq!(ausgehend.envelope.kind, EnvelopeKind::SenderKey);

    for empfaenger in [&bob, &carol] {
        let ergebnisse = alles_lesen(&server, empfaenger).await;
        assert_eq!(ergebnisse.len(), 2);
        assert!(matches!(
            &ergebnisse[0].1,
            DecryptResult::KeyMaterial { channel_id, sender, recovered }
                if *channel_id == kanal.channel_id && *sender == alice.account && recovered.is_empty()
        ));
        assert_eq!(texte(&ergebnisse), vec!["Hallo zusammen".to_string()]);
    }

    // Zweite Nachricht ohne erneute Verteilung
    alice
        .client
        .encrypt_outgoing(kanal.ziel(), "Noch was", None)
        .await
        .unwrap();
    let ergebnisse = alles_lesen(&server, &bob).await;
    assert_eq!(ergebnisse.len(), 1);
    assert_eq!(texte(&ergebnisse), vec!["Noch was".to_string()]);
}

#[tokio::test]
async fn entferntes_mitglied_kann_neue_generation_nicht_lesen() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let xaver = Geraet::bereit(&server).await;
    let kanal = kanal(&server, &[&alice, &bob, &xaver]).await;

    alice
        .client
        .encrypt_outgoing(kanal.ziel(), "alle", None)
        .await
        .unwrap();
    assert_eq!(texte(&alles_lesen(&server, &bob).await), vec!["alle".to_string()]);
    assert_eq!(texte(&alles_lesen(&server, &xaver).await), vec!["alle".to_string()]);

    // Xaver fliegt raus
    server
        .mitglieder_setzen(kanal.channel_id, vec![alice.account, bob.account])
        .await;
    alice
        .client
        .handle_event(SchluesselEreignis::MembershipChanged {
            server_id: kanal.server_id,
        })
        .await
        .unwrap();
    let eigen = alice
        .client
        .sender_keys()
        .eigener(kanal.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert!(eigen.invalidated);

    let geheim = alice
        .client
        .encrypt_outgoing(kanal.ziel(), "ohne Xaver", None)
        .await
        .unwrap();
    let nachricht = SenderKeyMessage::from_bytes(&geheim.envelope.ciphertext).unwrap();
    assert_eq!(nachricht.generation, 2);

    // Bob erhaelt die neue Generation vor der Nachricht
    let ergebnisse = alles_lesen(&server, &bob).await;
    assert!(matches!(ergebnisse[0].1, DecryptResult::KeyMaterial { .. }));
    assert_eq!(texte(&ergebnisse), vec!["ohne Xaver".to_string()]);

    // Xaver bekommt nichts zugestellt und kann abgefangene Nachrichten nicht lesen
    assert!(server.abholen(xaver.account).await.is_empty());
    assert!(matches!(
        xaver.client.decrypt_incoming(&geheim.envelope).await.unwrap(),
        DecryptResult::Undecryptable { .. }
    ));
}

#[tokio::test]
async fn geaenderte_mitgliederliste_fuehrt_zu_neuverteilung() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let carol = Geraet::bereit(&server).await;
    let kanal = kanal(&server, &[&alice, &bob]).await;

    let generation = alice
        .client
        .sender_keys()
        .ensure_distributed(kanal.server_id, kanal.channel_id, &[alice.account, bob.account])
        .await
        .unwrap();
    assert_eq!(generation, 1);

    // Carol tritt bei, ohne dass ein Ereignis eintrifft
    server
        .mitglieder_setzen(kanal.channel_id, vec![alice.account, bob.account, carol.account])
        .await;
    let ausgehend = alice
        .client
        .encrypt_outgoing(kanal.ziel(), "willkommen", None)
        .await
        .unwrap();
    assert_eq!(
        SenderKeyMessage::from_bytes(&ausgehend.envelope.ciphertext)
            .unwrap()
            .generation,
        2
    );
    assert_eq!(texte(&alles_lesen(&server, &carol).await), vec!["willkommen".to_string()]);
    assert_eq!(texte(&alles_lesen(&server, &bob).await), vec!["willkommen".to_string()]);
}

#[tokio::test]
async fn nachricht_vor_verteilung_wird_nachgeholt() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let kanal = kanal(&server, &[&alice, &bob]).await;

    alice
        .client
        .encrypt_outgoing(kanal.ziel(), "zu frueh", None)
        .await
        .unwrap();
    let mut eingang = server.abholen(bob.account).await;
    assert_eq!(eingang.len(), 2);
    let nachricht = eingang.remove(1);
    let verteilung = eingang.remove(0);
    assert_eq!(verteilung.kind, EnvelopeKind::SenderKeyDistribution);

    assert!(matches!(
        bob.client.decrypt_incoming(&nachricht).await.unwrap(),
        DecryptResult::Undecryptable { .. }
    ));
    assert_eq!(bob.client.pipeline().zurueckgestellt(), 1);

    match bob.client.decrypt_incoming(&verteilung).await.unwrap() {
        DecryptResult::KeyMaterial { recovered, .. } => {
            assert_eq!(recovered.len(), 1);
            assert_eq!(recovered[0].text, "zu frueh");
            assert_eq!(recovered[0].envelope.message_id, nachricht.message_id);
        }
        anderes => panic!("KeyMaterial erwartet, erhalten: {anderes:?}"),
    }
    assert_eq!(bob.client.pipeline().zurueckgestellt(), 0);

    // Danach aus Dedup und Klartext-Cache
    assert_eq!(
        bob.client.decrypt_incoming(&nachricht).await.unwrap(),
        DecryptResult::CacheHit("zu frueh".into())
    );
}

#[tokio::test]
async fn sender_keys_changed_fuer_eigenen_key_invalidiert() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let kanal = kanal(&server, &[&alice, &bob]).await;

    alice
        .client
        .encrypt_outgoing(kanal.ziel(), "eins", None)
        .await
        .unwrap();

    // Ankuendigung fuer einen fremden Sender laesst den eigenen Key unberuehrt
    alice
        .client
        .handle_event(SchluesselEreignis::SenderKeysChanged {
            channel_id: kanal.channel_id,
            sender: Some(bob.account),
        })
        .await
        .unwrap();
    let eigen = alice.client.sender_keys().eigener(kanal.channel_id).await.unwrap().unwrap();
    assert!(!eigen.invalidated);

    alice
        .client
        .handle_event(SchluesselEreignis::SenderKeysChanged {
            channel_id: kanal.channel_id,
            sender: None,
        })
        .await
        .unwrap();
    let eigen = alice.client.sender_keys().eigener(kanal.channel_id).await.unwrap().unwrap();
    assert!(eigen.invalidated);
}

/// Neues Geraet fuer dasselbe Konto, wiederhergestellt aus dem Backup
async fn wiederherstellen(server: &Arc<TestServer>, geraet: &Geraet) -> Geraet {
    geraet.client.export_backup("pw").await.unwrap();
    let neu = Geraet::mit_speicher(server, geraet.account, Arc::new(MemoryKeyStore::new())).await;
    neu.client.bootstrap().await.unwrap();
    neu.client.import_backup("pw").await.unwrap();
    neu
}

fn verteilungen(ergebnisse: &[(Envelope, DecryptResult)]) -> usize {
    ergebnisse
        .iter()
        .filter(|(_, e)| matches!(e, DecryptResult::KeyMaterial { .. }))
        .count()
}

#[tokio::test]
async fn neuer_sender_key_nach_wiederherstellung_wird_uebernommen() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let kanal = kanal(&server, &[&alice, &bob]).await;

    alice
        .client
        .encrypt_outgoing(kanal.ziel(), "vorher", None)
        .await
        .unwrap();
    assert_eq!(texte(&alles_lesen(&server, &bob).await), vec!["vorher".to_string()]);

    // Der eigene Sender-Key ging mit dem Speicher verloren und beginnt neu
    let neu = wiederherstellen(&server, &alice).await;
    let ausgehend = neu
        .client
        .encrypt_outgoing(kanal.ziel(), "nachher", None)
        .await
        .unwrap();
    let nachricht = SenderKeyMessage::from_bytes(&ausgehend.envelope.ciphertext).unwrap();
    assert_eq!(nachricht.generation, 1);

    let ergebnisse = alles_lesen(&server, &bob).await;
    assert_eq!(verteilungen(&ergebnisse), 1);
    assert_eq!(texte(&ergebnisse), vec!["nachher".to_string()]);
}

#[tokio::test]
async fn abgebrochene_verteilung_setzt_mit_demselben_key_fort() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    // Noch ohne veroeffentlichte Schluessel
    let nachzuegler = Geraet::neu(&server).await;
    let kanal = kanal(&server, &[&alice, &bob, &nachzuegler]).await;

    assert!(matches!(
        alice.client.encrypt_outgoing(kanal.ziel(), "zu frueh", None).await,
        Err(SessionError::Transport(_))
    ));
    assert_eq!(alice.client.pipeline().offene_bestaetigungen(), 0);

    let eigen = alice
        .client
        .sender_keys()
        .eigener(kanal.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(eigen.state.generation(), 1);
    assert!(!eigen.distributed_to.contains(&nachzuegler.account));
    let erster_versuch = alles_lesen(&server, &bob).await;

    nachzuegler.bootstrap().await;
    alice
        .client
        .encrypt_outgoing(kanal.ziel(), "jetzt alle", None)
        .await
        .unwrap();

    let eigen = alice
        .client
        .sender_keys()
        .eigener(kanal.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(eigen.state.generation(), 1);
    assert_eq!(eigen.distributed_to, eigen.mitglieder);

    // Bob bekommt genau eine Verteilung, egal in welchem Versuch
    let zweiter_versuch = alles_lesen(&server, &bob).await;
    assert_eq!(verteilungen(&erster_versuch) + verteilungen(&zweiter_versuch), 1);
    assert_eq!(texte(&zweiter_versuch), vec!["jetzt alle".to_string()]);

    let ergebnisse = alles_lesen(&server, &nachzuegler).await;
    assert_eq!(verteilungen(&ergebnisse), 1);
    assert_eq!(texte(&ergebnisse), vec!["jetzt alle".to_string()]);
}

#[tokio::test]
async fn zurueckgesetzter_peer_erhaelt_sender_key_erneut() {
    let server = TestServer::neu();
    let alice = Geraet::bereit(&server).await;
    let bob = Geraet::bereit(&server).await;
    let kanal = kanal(&server, &[&alice, &bob]).await;

    alice
        .client
        .encrypt_outgoing(kanal.ziel(), "eins", None)
        .await
        .unwrap();
    assert_eq!(texte(&alles_lesen(&server, &bob).await), vec!["eins".to_string()]);
    bob.client
        .encrypt_outgoing(Destination::user(alice.account), "direkt", None)
        .await
        .unwrap();
    alles_lesen(&server, &alice).await;

    // Bob verliert seine Sitzungen und meldet sich bei der naechsten Nachricht
    let neu = wiederherstellen(&server, &bob).await;
    alice
        .client
        .encrypt_outgoing(Destination::user(bob.account), "noch da?", None)
        .await
        .unwrap();
    let ergebnisse = alles_lesen(&server, &neu).await;
    assert!(matches!(ergebnisse[0].1, DecryptResult::Undecryptable { .. }));

    let ergebnisse = alles_lesen(&server, &alice).await;
    assert_eq!(ergebnisse.len(), 1);
    assert_eq!(
        ergebnisse[0].1,
        DecryptResult::SessionRefreshed { peer: bob.account }
    );
    let eigen = alice
        .client
        .sender_keys()
        .eigener(kanal.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert!(eigen.distributed_to.is_empty());

    let ausgehend = alice
        .client
        .encrypt_outgoing(kanal.ziel(), "zwei", None)
        .await
        .unwrap();
    assert_eq!(
        SenderKeyMessage::from_bytes(&ausgehend.envelope.ciphertext)
            .unwrap()
            .generation,
        1
    );
    let ergebnisse = alles_lesen(&server, &neu).await;
    assert_eq!(verteilungen(&ergebnisse), 1);
    assert_eq!(texte(&ergebnisse), vec!["zwei".to_string()]);
}
