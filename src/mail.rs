use serde::Serialize;

/// The email collaborator. The pipeline only ever needs a per-call
/// success/failure outcome; what lies behind it is a black box.
pub trait Mailer: Sync {
    fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Delivers through an HTTP relay endpoint (transactional mail API).
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("MAIL_API_URL")
            .map_err(|_| anyhow::anyhow!("MAIL_API_URL is not set"))?;
        let token = std::env::var("MAIL_API_TOKEN").ok();
        let from = std::env::var("MAIL_FROM")
            .unwrap_or_else(|_| "tender-alerts@localhost".to_owned());

        let client = reqwest::Client::builder()
            .connect_timeout(const { core::time::Duration::from_secs(8) })
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token,
            from,
        })
    }
}

impl Mailer for HttpMailer {
    fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        #[derive(Serialize)]
        struct Payload<'a> {
            from: &'a str,
            to: &'a str,
            subject: &'a str,
            html: &'a str,
        }

        async move {
            let mut request = self.client.post(&self.endpoint).json(&Payload {
                from: &self.from,
                to,
                subject,
                html,
            });
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("mail relay returned {status}: {}", body.trim())
            }
        }
    }
}
