//! Integration tests for the server and the headless client
//!
//! Each test starts a real server on an ephemeral port with in-memory
//! backends and drives it with one or more bots over TCP.

use client::network::{Bot, BotError};
use server::backend::{BanList, PlayerDb, PlayerRecord, World};
use server::memory::{FlatWorld, MemoryBanList, MemoryPlayerDb, BLOCK_BEDROCK, BLOCK_STONE};
use server::{Rank, Server, ServerConfig, VerifyNames};
use shared::codec::Handshake;
use shared::verify::name_token;
use shared::{Message, PaddedString, Position, SELF_ID};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

struct TestServer {
    server: Server,
    players: Arc<MemoryPlayerDb>,
    bans: Arc<MemoryBanList>,
    world: Arc<FlatWorld>,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        let players = Arc::new(MemoryPlayerDb::default());
        let bans = Arc::new(MemoryBanList::new());
        let world = Arc::new(FlatWorld::new(config.map_dimensions()));

        let mut server = Server::bind(
            config,
            Arc::clone(&players) as Arc<dyn PlayerDb>,
            Arc::clone(&bans) as Arc<dyn BanList>,
            Arc::clone(&world) as Arc<dyn World>,
        )
        .expect("Failed to bind test server");
        server.start().expect("Failed to start test server");

        TestServer {
            server,
            players,
            bans,
            world,
        }
    }

    fn addr(&self) -> String {
        self.server.local_addr().to_string()
    }

    async fn join(&self, name: &str) -> Bot {
        self.try_join(name).await.expect("Login failed")
    }

    async fn try_join(&self, name: &str) -> Result<Bot, BotError> {
        let mut bot = Bot::connect(&self.addr()).await?;
        bot.login(name, &name_token(self.server.salt(), name)).await?;
        Ok(bot)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        server_name: "Test Server".to_string(),
        motd: "Integration".to_string(),
        max_connections_per_ip: 0,
        map_width: 16,
        map_height: 16,
        map_length: 16,
        kick_timeout_ms: 500,
        shutdown_grace_ms: 200,
        ..ServerConfig::default()
    }
}

/// LOGIN SEQUENCE TESTS
mod login_tests {
    use super::*;

    /// Tests identification, level download and spawn for a fresh player
    #[tokio::test]
    async fn login_sends_identification_level_and_spawn() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;

        let state = alice.state();
        let identification = state.identification.as_ref().unwrap();
        assert_eq!(identification.protocol_version, shared::PROTOCOL_VERSION);
        assert_eq!(identification.server_name.to_text(), "Test Server");
        assert_eq!(identification.motd.to_text(), "Integration");
        assert_eq!(state.user_type, shared::USER_TYPE_NORMAL);
        assert_eq!(state.dimensions(), Some(test.world.dimensions()));
        assert_eq!(state.block(0, 0, 0), Some(BLOCK_BEDROCK));
        assert_eq!(state.position, test.world.spawn());

        let line = alice.wait_for_chat("joined the server", WAIT).await.unwrap();
        assert_eq!(line, "&eAlice joined the server");
        assert_eq!(test.players.get("alice").unwrap().times_visited, 1);
    }

    /// Tests that players see each other on both sides of a login
    #[tokio::test]
    async fn players_see_each_other() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;
        let bob = test.join("Bob").await;

        let (alice_id, entity) = bob.state().find_entity("Alice").unwrap();
        assert_eq!(entity.position, test.world.spawn());

        let added = alice
            .wait_for(WAIT, |message| matches!(message, Message::AddEntity(_)))
            .await
            .unwrap();
        let Message::AddEntity(added) = added else {
            unreachable!()
        };
        assert_eq!(added.name.to_text(), "Bob");
        assert_ne!(added.id, alice_id);
        assert_eq!(test.server.player_count(), 2);
    }

    /// Tests that logging in twice evicts the older session
    #[tokio::test]
    async fn duplicate_login_evicts_ghost() {
        let test = TestServer::start(config());
        let mut first = test.join("Alice").await;
        let _second = test.join("alice").await;

        let reason = first.wait_for_kick(WAIT).await.unwrap();
        assert_eq!(reason, "Connected from elsewhere!");
        assert_eq!(test.server.player_count(), 1);
    }

    /// Tests handshake rejections
    #[tokio::test]
    async fn malformed_handshakes_are_rejected() {
        let test = TestServer::start(config());

        let mut bot = Bot::connect(&test.addr()).await.unwrap();
        bot.send(&Message::chat("hi")).await.unwrap();
        assert_eq!(
            bot.wait_for_kick(WAIT).await.unwrap(),
            "Unexpected handshake message"
        );

        let mut bot = Bot::connect(&test.addr()).await.unwrap();
        bot.send(&Message::Handshake(Handshake {
            protocol_version: 6,
            name: PaddedString::new("Alice"),
            verification_key: PaddedString::new(""),
            unused: 0,
        }))
        .await
        .unwrap();
        assert_eq!(
            bot.wait_for_kick(WAIT).await.unwrap(),
            "Incompatible protocol version!"
        );

        let mut bot = Bot::connect(&test.addr()).await.unwrap();
        match bot.login("no spaces!", "").await {
            Err(BotError::Kicked(reason)) => assert_eq!(reason, "Invalid characters in player name!"),
            other => panic!("expected a kick, got {:?}", other.map(|_| ())),
        }
    }
}

/// ACCESS CONTROL TESTS
mod access_tests {
    use super::*;

    fn kicked(result: Result<Bot, BotError>) -> String {
        match result {
            Err(BotError::Kicked(reason)) => reason,
            Err(other) => panic!("expected a kick, got {}", other),
            Ok(_) => panic!("expected a kick, got a login"),
        }
    }

    /// Tests that a bad key is fatal under the strict policy
    #[tokio::test]
    async fn strict_verification_rejects_bad_key() {
        let test = TestServer::start(ServerConfig {
            verify_names: VerifyNames::Always,
            ..config()
        });

        let mut bot = Bot::connect(&test.addr()).await.unwrap();
        let reason = match bot.login("Alice", "not-the-key").await {
            Err(BotError::Kicked(reason)) => reason,
            other => panic!("expected a kick, got {:?}", other),
        };
        assert_eq!(reason, "Could not verify player name!");
        assert_eq!(test.players.get("Alice").unwrap().failed_logins, 1);
    }

    /// Tests that the lenient policy admits unverified players and warns others
    #[tokio::test]
    async fn lenient_verification_announces_unverified_players() {
        let test = TestServer::start(ServerConfig {
            verify_names: VerifyNames::Never,
            ..config()
        });
        let mut alice = test.join("Alice").await;

        let mut mallory = Bot::connect(&test.addr()).await.unwrap();
        mallory.login("Mallory", "forged").await.unwrap();

        let line = alice.wait_for_chat("unverified", WAIT).await.unwrap();
        assert_eq!(line, "&cName and IP of Mallory are unverified!");
    }

    fn returning(name: &str, last_ip: IpAddr) -> PlayerRecord {
        PlayerRecord {
            times_visited: 3,
            last_ip: Some(last_ip),
            ..PlayerRecord::new(name, Rank::Builder)
        }
    }

    fn balanced() -> ServerConfig {
        ServerConfig {
            verify_names: VerifyNames::Balanced,
            ..config()
        }
    }

    /// Tests that the balanced policy refuses unverified first visits
    #[tokio::test]
    async fn balanced_verification_rejects_first_visit() {
        let test = TestServer::start(balanced());

        let mut bot = Bot::connect(&test.addr()).await.unwrap();
        let reason = match bot.login("Mallory", "forged").await {
            Err(BotError::Kicked(reason)) => reason,
            other => panic!("expected a kick, got {:?}", other),
        };
        assert_eq!(reason, "Could not verify player name!");
        let record = test.players.get("mallory").unwrap();
        assert_eq!(record.failed_logins, 1);
        assert_eq!(record.times_visited, 0);
    }

    /// Tests that the balanced policy admits a returning player on the same IP
    #[tokio::test]
    async fn balanced_verification_admits_known_ip() {
        let test = TestServer::start(balanced());
        test.players
            .insert(returning("Mallory", IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let mut alice = test.join("Alice").await;

        let mut mallory = Bot::connect(&test.addr()).await.unwrap();
        mallory.login("Mallory", "forged").await.unwrap();

        let line = alice.wait_for_chat("unverified", WAIT).await.unwrap();
        assert_eq!(line, "&cName of Mallory is unverified!");
        assert_eq!(test.players.get("mallory").unwrap().times_visited, 4);
        assert_eq!(test.server.player_count(), 2);
    }

    /// Tests that the balanced policy refuses a returning player on a new IP
    #[tokio::test]
    async fn balanced_verification_rejects_changed_ip() {
        let test = TestServer::start(balanced());
        test.players
            .insert(returning("Mallory", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))));

        let mut bot = Bot::connect(&test.addr()).await.unwrap();
        let reason = match bot.login("Mallory", "forged").await {
            Err(BotError::Kicked(reason)) => reason,
            other => panic!("expected a kick, got {:?}", other),
        };
        assert_eq!(reason, "Could not verify player name!");
        assert_eq!(test.players.get("mallory").unwrap().failed_logins, 1);
        assert_eq!(test.server.player_count(), 0);
    }

    /// Tests name and IP bans
    #[tokio::test]
    async fn banned_players_are_kicked_with_reason() {
        let test = TestServer::start(config());

        test.players.ban("Mallory", "Admin", "griefing");
        let reason = kicked(test.try_join("Mallory").await);
        assert!(reason.starts_with("Banned"), "{}", reason);
        assert!(reason.ends_with("by Admin: griefing"), "{}", reason);
        assert_eq!(test.players.get("mallory").unwrap().failed_logins, 1);

        test.bans
            .ban_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), "Admin", "proxy");
        let reason = kicked(test.try_join("Alice").await);
        assert!(reason.starts_with("IP-banned"), "{}", reason);
        assert!(reason.ends_with("proxy"), "{}", reason);
    }

    /// Tests the player limit and the operator reserved slot
    #[tokio::test]
    async fn full_server_rejects_all_but_operators() {
        let test = TestServer::start(ServerConfig {
            max_players: 1,
            ..config()
        });
        let _alice = test.join("Alice").await;

        assert_eq!(kicked(test.try_join("Bob").await), "Server is full!");

        test.players.find_or_create("Olivia");
        test.players.set_rank("Olivia", Rank::Operator);
        let olivia = test.join("Olivia").await;
        assert_eq!(olivia.state().user_type, shared::USER_TYPE_OP);
        assert_eq!(test.server.player_count(), 2);
    }

    /// Tests the per-IP connection limit
    #[tokio::test]
    async fn too_many_connections_from_one_ip() {
        let test = TestServer::start(ServerConfig {
            max_connections_per_ip: 1,
            ..config()
        });
        let _alice = test.join("Alice").await;

        let mut extra = Bot::connect(&test.addr()).await.unwrap();
        assert_eq!(
            extra.wait_for_kick(WAIT).await.unwrap(),
            "Too many connections from your IP address"
        );
    }
}

/// GAMEPLAY TESTS
mod gameplay_tests {
    use super::*;

    /// Tests chat relay and the player list command
    #[tokio::test]
    async fn chat_is_relayed_with_display_name() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;
        let mut bob = test.join("Bob").await;

        alice.send_chat("hello there").await.unwrap();
        let line = bob.wait_for_chat("hello there", WAIT).await.unwrap();
        assert_eq!(line, "&fAlice&f: hello there");

        bob.send_chat("/players").await.unwrap();
        let list = bob.wait_for_chat("Players online", WAIT).await.unwrap();
        assert_eq!(list, "Players online (2): Alice, Bob");
    }

    /// Tests that long server messages arrive as several wrapped lines
    #[tokio::test]
    async fn long_messages_are_wrapped() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;

        test.server.say(
            "the quick brown fox jumps over the lazy dog while the server keeps on talking until zulu",
        );
        let last = alice.wait_for_chat("zulu", WAIT).await.unwrap();
        assert!(!last.contains("[Console]"), "{}", last);
        assert!(last.len() <= shared::codec::STRING_LEN);
    }

    /// Tests relative movement updates and full teleports for long jumps
    #[tokio::test]
    async fn movement_is_relayed_to_others() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;
        let mut bob = test.join("Bob").await;
        let (alice_id, _) = bob.state().find_entity("Alice").unwrap();

        let spawn = test.world.spawn();
        let step = Position {
            x: spawn.x + 32,
            ..spawn
        };
        alice.move_to(step).await.unwrap();
        bob.wait_for(WAIT, |message| {
            matches!(message, Message::Move(update) if update.id == alice_id)
        })
        .await
        .unwrap();
        assert_eq!(bob.state().entity(alice_id).unwrap().position, step);

        let jump = Position {
            x: spawn.x - 200,
            ..spawn
        };
        alice.move_to(jump).await.unwrap();
        bob.wait_for(WAIT, |message| {
            matches!(message, Message::Teleport(update) if update.id == alice_id)
        })
        .await
        .unwrap();
        assert_eq!(bob.state().entity(alice_id).unwrap().position, jump);
    }

    /// Tests that frozen players are teleported back instead of moving
    #[tokio::test]
    async fn frozen_players_are_sent_back() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;
        let spawn = test.world.spawn();

        assert!(test.server.set_frozen("Alice", true));
        alice
            .move_to(Position {
                x: spawn.x + 64,
                ..spawn
            })
            .await
            .unwrap();

        let corrected = alice
            .wait_for(WAIT, |message| {
                matches!(message, Message::Teleport(update) if update.id == SELF_ID)
            })
            .await
            .unwrap();
        assert_eq!(corrected, Message::teleport(SELF_ID, spawn));
        assert_eq!(alice.state().position, spawn);

        assert!(test.server.set_frozen("Alice", false));
        let step = Position {
            x: spawn.x + 32,
            ..spawn
        };
        alice.move_to(step).await.unwrap();
        // A correction would arrive before the reply to a later command.
        alice.send_chat("/players").await.unwrap();
        let line = alice.wait_for_chat("Players online", WAIT).await.unwrap();
        assert_eq!(line, "Players online (1): Alice");
        assert_eq!(alice.state().position, step);
    }

    /// Tests that leaving the map is treated as hacking
    #[tokio::test]
    async fn out_of_bounds_movement_kicks() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;

        alice
            .move_to(Position::new(-1, 100, 100, 0, 0))
            .await
            .unwrap();
        let reason = alice.wait_for_kick(WAIT).await.unwrap();
        assert!(reason.starts_with("Hacking detected"), "{}", reason);
    }

    /// Tests block placement broadcasts and reverts
    #[tokio::test]
    async fn block_changes_are_applied_or_reverted() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;
        let mut bob = test.join("Bob").await;

        alice.set_block((2, 10, 2), true, BLOCK_STONE).await.unwrap();
        bob.wait_for(WAIT, |message| {
            matches!(message, Message::SetBlock(change) if (change.x, change.y, change.z) == (2, 10, 2))
        })
        .await
        .unwrap();
        assert_eq!(bob.state().block(2, 10, 2), Some(BLOCK_STONE));
        assert_eq!(test.world.block(2, 10, 2), Some(BLOCK_STONE));

        alice.set_block((3, 0, 3), false, BLOCK_STONE).await.unwrap();
        let revert = alice
            .wait_for(WAIT, |message| matches!(message, Message::SetBlock(_)))
            .await
            .unwrap();
        assert_eq!(
            revert,
            Message::SetBlock(shared::codec::SetBlock {
                x: 3,
                y: 0,
                z: 3,
                block: BLOCK_BEDROCK
            })
        );
        assert_eq!(alice.state().block(3, 0, 3), Some(BLOCK_BEDROCK));
    }

    /// Tests that guests cannot build
    #[tokio::test]
    async fn guests_get_reverted() {
        let test = TestServer::start(config());
        test.players.find_or_create("Gus");
        test.players.set_rank("Gus", Rank::Guest);
        let mut gus = test.join("Gus").await;

        gus.set_block((4, 10, 4), true, BLOCK_STONE).await.unwrap();
        gus.wait_for(WAIT, |message| matches!(message, Message::SetBlock(_)))
            .await
            .unwrap();
        assert_eq!(gus.state().block(4, 10, 4), Some(0));
        assert_eq!(test.world.change_count(), 0);
    }

    /// Tests that non-printable chat is rejected
    #[tokio::test]
    async fn illegal_chat_characters_kick() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;

        let mut raw = vec![0x0d, 0xff];
        raw.extend([0x07u8; shared::codec::STRING_LEN]);
        alice.send_raw(&raw).await.unwrap();
        assert_eq!(
            alice.wait_for_kick(WAIT).await.unwrap(),
            "Illegal character in chat message!"
        );
    }
}

/// ADMINISTRATION TESTS
mod admin_tests {
    use super::*;

    /// Tests manual saves through the background loop
    #[tokio::test]
    async fn save_now_runs_in_background() {
        let test = TestServer::start(config());
        test.server.save_now();

        let deadline = Instant::now() + WAIT;
        while test.server.saves_completed() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(test.world.saves(), 1);
        assert_eq!(test.server.saves_completed(), 1);
    }

    /// Tests rank changes for an online player
    #[tokio::test]
    async fn rank_change_updates_permission() {
        let test = TestServer::start(config());
        let mut bob = test.join("Bob").await;

        assert!(test.server.change_rank("Bob", Rank::Operator));
        bob.wait_for(WAIT, |message| {
            matches!(message, Message::SetPermission { user_type } if *user_type == shared::USER_TYPE_OP)
        })
        .await
        .unwrap();
        assert_eq!(bob.state().user_type, shared::USER_TYPE_OP);
        assert_eq!(test.players.get("bob").unwrap().rank, Rank::Operator);
    }

    /// Tests kicking by name and despawning for the remaining players
    #[tokio::test]
    async fn kick_by_name_despawns_player() {
        let test = TestServer::start(config());
        let mut alice = test.join("Alice").await;
        let mut bob = test.join("Bob").await;
        alice
            .wait_for(WAIT, |message| matches!(message, Message::AddEntity(_)))
            .await
            .unwrap();
        let (bob_id, _) = alice.state().find_entity("Bob").unwrap();

        assert!(test.server.kick("bob", "Be nice"));
        assert_eq!(bob.wait_for_kick(WAIT).await.unwrap(), "Be nice");

        let removed = alice
            .wait_for(WAIT, |message| matches!(message, Message::RemoveEntity { .. }))
            .await
            .unwrap();
        assert_eq!(removed, Message::RemoveEntity { id: bob_id });
        alice.wait_for_chat("Bob left the server", WAIT).await.unwrap();
    }

    /// Tests hiding a player from lower ranks
    #[tokio::test]
    async fn hidden_players_despawn() {
        let test = TestServer::start(config());
        test.players.find_or_create("Alice");
        test.players.set_rank("Alice", Rank::Guest);
        let mut alice = test.join("Alice").await;
        let _bob = test.join("Bob").await;
        alice
            .wait_for(WAIT, |message| matches!(message, Message::AddEntity(_)))
            .await
            .unwrap();
        let (bob_id, _) = alice.state().find_entity("Bob").unwrap();

        assert!(test.server.set_hidden("Bob", true));
        let removed = alice
            .wait_for(WAIT, |message| matches!(message, Message::RemoveEntity { .. }))
            .await
            .unwrap();
        assert_eq!(removed, Message::RemoveEntity { id: bob_id });
        assert_eq!(test.server.player_list(), "Players online (1): Alice");
    }
}

/// BANDWIDTH TESTS
mod throttle_tests {
    use super::*;

    /// Tests that a backlog drains at no more than the per-tick cap
    #[tokio::test]
    async fn packet_cap_limits_delivery_rate() {
        let test = TestServer::start(ServerConfig {
            ticks_per_second: 10,
            packets_per_second: 10,
            ..config()
        });
        let mut alice = test.join("Alice").await;
        alice
            .wait_for_chat("joined the server", Duration::from_secs(5))
            .await
            .unwrap();

        let start = Instant::now();
        for line in 0..30 {
            test.server.say(&format!("line {}", line));
        }
        alice
            .wait_for_chat("line 29", Duration::from_secs(10))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        // 30 packets at one per 100 ms tick
        assert!(elapsed >= Duration::from_secs(2), "drained in {:?}", elapsed);
    }
}
