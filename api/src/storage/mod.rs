use async_trait::async_trait;
use aws_sdk_s3::Client;

use crate::config::AppConfig;
use crate::types::CampaignId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// キャンペーンに添付する画像の置き場所。キーはキャンペーンIDから規約で決まる。
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put_campaign_media(&self, campaign_id: &CampaignId, media: Media)
    -> Result<(), String>;
    /// 添付がなければ `None`
    async fn get_campaign_media(&self, campaign_id: &CampaignId) -> Result<Option<Media>, String>;
}

pub fn campaign_media_key(campaign_id: &CampaignId) -> String {
    format!("campaign-media/{campaign_id}")
}

#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(config: &AppConfig) -> Self {
        let mut s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &config.s3_endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        let sdk_config = s3_config
            .region(aws_config::Region::new(config.s3_region.clone()))
            .load()
            .await;

        let client = Client::new(&sdk_config);
        Self {
            client,
            bucket: config.s3_bucket.clone(),
        }
    }
}

#[async_trait]
impl MediaStore for S3Storage {
    async fn put_campaign_media(
        &self,
        campaign_id: &CampaignId,
        media: Media,
    ) -> Result<(), String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(campaign_media_key(campaign_id))
            .body(media.data.into())
            .content_type(media.content_type)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn get_campaign_media(&self, campaign_id: &CampaignId) -> Result<Option<Media>, String> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(campaign_media_key(campaign_id))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let e = e.into_service_error();
                if e.is_no_such_key() {
                    return Ok(None);
                }
                return Err(e.to_string());
            }
        };
        let content_type = resp
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| e.to_string())?
            .into_bytes();
        Ok(Some(Media {
            data: bytes.to_vec(),
            content_type,
        }))
    }
}
