mod connection;
pub mod mailbox;
pub mod reply;
pub mod server;
mod session;

pub use session::SessionDeps;

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use smtp_proto::Request;
    use sqlx::PgPool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::auth::{AuthVerifier, DnsResolver};
    use crate::auth::resolver::MockZone;
    use crate::bus::LocalEventStream;
    use crate::config::Config;
    use crate::directory::mock::MockDirectory;
    use crate::directory::UserInfo;
    use crate::smtp::connection;
    use crate::smtp::session::SessionDeps;
    use crate::store::{
        List, ListRepository, MemberPolicy, MemberRepository, MessageRepository, NewList,
        ObjectStore, SenderPolicy,
    };

    fn deps(pool: PgPool, blobs: Arc<dyn ObjectStore>, directory: Arc<MockDirectory>) -> SessionDeps {
        let zone = MockZone::default();
        let auth = Arc::new(AuthVerifier::new(
            DnsResolver::Mock(zone),
            "mx.test-org-1.com".to_owned(),
        ));

        SessionDeps {
            config: Arc::new(Config {
                authdomain: "mx.test-org-1.com".to_owned(),
                usrdomain: "test-org-1.com".to_owned(),
                orgdomain: "lists.test-org-1.com".to_owned(),
                ..Config::default()
            }),
            auth,
            lists: Arc::new(ListRepository::new(pool.clone())),
            members: Arc::new(MemberRepository::new(pool.clone())),
            messages: Arc::new(MessageRepository::new(pool)),
            blobs,
            users: directory.clone(),
            orgs: directory.clone(),
            authorizer: directory,
            events: Arc::new(LocalEventStream::new()),
        }
    }

    async fn seed_list(pool: &PgPool, directory: &MockDirectory) -> List {
        directory.users.lock().unwrap().insert(
            "john".to_owned(),
            UserInfo {
                user_id: "u-john".to_owned(),
                email: "john@test-org-1.com".to_owned(),
            },
        );
        directory
            .active
            .lock()
            .unwrap()
            .insert("u-john".to_owned(), true);

        let lists = ListRepository::new(pool.clone());
        lists
            .create(
                &NewList {
                    creator_id: "u-john".to_owned(),
                    listname: "engineering".to_owned(),
                    display_name: "Engineering".to_owned(),
                    description: String::new(),
                    sender_policy: SenderPolicy::User,
                    member_policy: MemberPolicy::User,
                },
                1,
            )
            .await
            .unwrap()
    }

    fn parse(line: &str) -> Result<Request<String>, smtp_proto::Error> {
        Request::parse(&mut line.as_bytes().iter())
    }

    #[sqlx::test]
    async fn accepted_message_is_persisted(pool: PgPool) {
        let directory = Arc::new(MockDirectory::default());
        let list = seed_list(&pool, &directory).await;

        let tmp = std::env::temp_dir().join(format!("threadmail-blobs-{}", rand::random::<u64>()));
        let blobs: Arc<dyn ObjectStore> = Arc::new(crate::store::LocalBlobStore::new(tmp));

        let deps = deps(pool.clone(), blobs, directory);

        let (mut client, mut server_side) = tokio::io::duplex(8192);

        let handle = tokio::spawn(async move {
            connection::handle(&mut server_side, "mx.test-org-1.com", "127.0.0.1:0".parse().unwrap(), deps)
                .await
                .ok();
        });

        let mut greeting = [0u8; 256];
        client.read(&mut greeting).await.unwrap();

        client.write_all(b"EHLO client.example.com\r\n").await.unwrap();
        let mut buf = [0u8; 256];
        client.read(&mut buf).await.unwrap();

        client
            .write_all(b"MAIL FROM:<john@test-org-1.com>\r\n")
            .await
            .unwrap();
        client.read(&mut buf).await.unwrap();

        let rcpt = format!("RCPT TO:<{}@{}>\r\n", list.list_id, "test-org-1.com");
        client.write_all(rcpt.as_bytes()).await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("250"));

        client.write_all(b"DATA\r\n").await.unwrap();
        client.read(&mut buf).await.unwrap();

        client
            .write_all(b"From: john@test-org-1.com\r\nSubject: hi\r\nMessage-ID: <m1@test-org-1.com>\r\n\r\nbody\r\n.\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("250"));

        client.write_all(b"QUIT\r\n").await.unwrap();

        handle.await.unwrap();

        let messages = MessageRepository::new(pool);
        let stored = messages.find(&list.list_id, "<m1@test-org-1.com>").await.unwrap();
        assert!(stored.is_some());
    }

    #[test]
    fn parses_ehlo_and_mail_commands() {
        assert!(matches!(parse("EHLO client.example.com\r\n"), Ok(Request::Ehlo { .. })));
        assert!(matches!(
            parse("MAIL FROM:<john@test-org-1.com>\r\n"),
            Ok(Request::Mail { .. })
        ));
    }
}
